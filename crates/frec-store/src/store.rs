//! SQLite-backed identity store.

use crate::schema::SCHEMA;
use crate::types::{EmbeddingRecord, EnrollmentImage, Identity};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store is not open")]
    NotOpen,
    #[error("identity name already exists: {0}")]
    DuplicateName(String),
    #[error("enrollment image already recorded: {0}")]
    DuplicatePath(String),
    #[error("identity not found: {0}")]
    IdentityNotFound(i64),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable storage for identities, enrollment images and embeddings.
///
/// The connection sits behind a mutex so a single store can be shared as
/// `Arc<IdentityStore>` between the recognition engine and command handlers.
/// Every operation fails with [`StoreError::NotOpen`] once the store is closed.
pub struct IdentityStore {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn identity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Identity> {
    Ok(Identity {
        id: row.get(0)?,
        name: row.get(1)?,
        enrollment_count: row.get(2)?,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

fn embedding_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EmbeddingRecord> {
    Ok(EmbeddingRecord {
        id: row.get(0)?,
        identity_id: row.get(1)?,
        source_path: row.get(2)?,
        vector_bytes: row.get(3)?,
        created_at: row.get(4)?,
    })
}

/// Recompute `enrollment_count` from the embeddings table.
fn refresh_count(conn: &Connection, identity_id: i64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE identities
         SET enrollment_count = (SELECT COUNT(*) FROM embeddings WHERE identity_id = ?1),
             updated_at = ?2
         WHERE id = ?1",
        params![identity_id, now()],
    )
}

impl IdentityStore {
    /// Open (or create) the database file. Call [`initialize`](Self::initialize)
    /// before any other operation.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        tracing::info!(path = %path.display(), "opened identity store");
        Ok(Self {
            path,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open a private in-memory store. Used by tests and tooling.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Create tables and indexes if they do not exist.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let guard = self.lock();
        let conn = guard.as_ref().ok_or(StoreError::NotOpen)?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!(path = %self.path.display(), "identity store schema ready");
        Ok(())
    }

    /// Close the connection. Subsequent calls fail with `NotOpen`.
    pub fn close(&self) {
        if let Some(conn) = self.lock().take() {
            if let Err((_, e)) = conn.close() {
                tracing::warn!(error = %e, "identity store close failed");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(StoreError::NotOpen)?;
        f(conn)
    }

    // --- identities ---

    /// Insert a new identity and return its id. Fails on a duplicate name
    /// without touching the existing row.
    pub fn add_identity(&self, name: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let ts = now();
            match conn.execute(
                "INSERT INTO identities (name, enrollment_count, created_at, updated_at)
                 VALUES (?1, 0, ?2, ?2)",
                params![name, ts],
            ) {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(e) if is_constraint_violation(&e) => {
                    Err(StoreError::DuplicateName(name.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_identity(&self, id: i64) -> Result<Option<Identity>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, enrollment_count, created_at, updated_at
                     FROM identities WHERE id = ?1",
                    [id],
                    identity_from_row,
                )
                .optional()?)
        })
    }

    pub fn get_identity_by_name(&self, name: &str) -> Result<Option<Identity>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, enrollment_count, created_at, updated_at
                     FROM identities WHERE name = ?1",
                    [name],
                    identity_from_row,
                )
                .optional()?)
        })
    }

    /// All identities ordered by id.
    pub fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, enrollment_count, created_at, updated_at
                 FROM identities ORDER BY id",
            )?;
            let rows = stmt.query_map([], identity_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn rename_identity(&self, id: i64, name: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            match conn.execute(
                "UPDATE identities SET name = ?1, updated_at = ?2 WHERE id = ?3",
                params![name, now(), id],
            ) {
                Ok(0) => Err(StoreError::IdentityNotFound(id)),
                Ok(_) => Ok(()),
                Err(e) if is_constraint_violation(&e) => {
                    Err(StoreError::DuplicateName(name.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Delete an identity; its images and embeddings go with it.
    pub fn delete_identity(&self, id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM identities WHERE id = ?1", [id])?;
            if removed == 0 {
                return Err(StoreError::IdentityNotFound(id));
            }
            tracing::info!(identity_id = id, "identity deleted");
            Ok(())
        })
    }

    pub fn count_identities(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM identities", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }

    // --- enrollment images ---

    pub fn add_enrollment_image(&self, identity_id: i64, file_path: &str) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            match conn.execute(
                "INSERT INTO enrollment_images (identity_id, file_path, created_at)
                 VALUES (?1, ?2, ?3)",
                params![identity_id, file_path, now()],
            ) {
                Ok(_) => Ok(conn.last_insert_rowid()),
                Err(e) if is_constraint_violation(&e) => {
                    // Either the path is already recorded or the identity is gone.
                    let exists: bool = conn
                        .query_row(
                            "SELECT EXISTS(SELECT 1 FROM identities WHERE id = ?1)",
                            [identity_id],
                            |r| r.get(0),
                        )?;
                    if exists {
                        Err(StoreError::DuplicatePath(file_path.to_string()))
                    } else {
                        Err(StoreError::IdentityNotFound(identity_id))
                    }
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn list_enrollment_images(&self, identity_id: i64) -> Result<Vec<EnrollmentImage>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, identity_id, file_path, created_at
                 FROM enrollment_images WHERE identity_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([identity_id], |row| {
                Ok(EnrollmentImage {
                    id: row.get(0)?,
                    identity_id: row.get(1)?,
                    file_path: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // --- embeddings ---

    /// Store an embedding and refresh the identity's enrollment count in the
    /// same transaction.
    pub fn add_embedding(
        &self,
        identity_id: i64,
        source_path: &str,
        vector_bytes: &[u8],
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT INTO embeddings (identity_id, source_path, vector_bytes, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![identity_id, source_path, vector_bytes, now()],
            );
            match inserted {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(StoreError::IdentityNotFound(identity_id));
                }
                Err(e) => return Err(e.into()),
            }
            let id = tx.last_insert_rowid();
            refresh_count(&tx, identity_id)?;
            tx.commit()?;
            Ok(id)
        })
    }

    /// Embeddings for one identity, or for all identities when `identity_id`
    /// is `None`. Ordered by insertion.
    pub fn list_embeddings(&self, identity_id: Option<i64>) -> Result<Vec<EmbeddingRecord>, StoreError> {
        self.with_conn(|conn| {
            let records = match identity_id {
                Some(id) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, identity_id, source_path, vector_bytes, created_at
                         FROM embeddings WHERE identity_id = ?1 ORDER BY id",
                    )?;
                    let rows = stmt.query_map([id], embedding_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, identity_id, source_path, vector_bytes, created_at
                         FROM embeddings ORDER BY id",
                    )?;
                    let rows = stmt.query_map([], embedding_from_row)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                }
            };
            Ok(records)
        })
    }

    /// Remove one embedding row and refresh its identity's count.
    pub fn delete_embedding(&self, embedding_id: i64) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let owner: Option<i64> = tx
                .query_row(
                    "SELECT identity_id FROM embeddings WHERE id = ?1",
                    [embedding_id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(identity_id) = owner else {
                return Ok(false);
            };
            tx.execute("DELETE FROM embeddings WHERE id = ?1", [embedding_id])?;
            refresh_count(&tx, identity_id)?;
            tx.commit()?;
            Ok(true)
        })
    }

    /// Drop every embedding and zero all counts. Used before a full retrain.
    pub fn clear_all_embeddings(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM embeddings", [])?;
            tx.execute(
                "UPDATE identities SET enrollment_count = 0, updated_at = ?1",
                [now()],
            )?;
            tx.commit()?;
            tracing::info!(removed, "cleared all embeddings");
            Ok(())
        })
    }

    /// Swap the whole embedding table for `rows` (identity id, source path,
    /// vector bytes) in one transaction. On any failure the previous rows
    /// and counts stay as they were.
    pub fn replace_all_embeddings(&self, rows: &[(i64, String, Vec<u8>)]) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute("DELETE FROM embeddings", [])?;
            {
                let mut insert = tx.prepare(
                    "INSERT INTO embeddings (identity_id, source_path, vector_bytes, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                let created = now();
                for (identity_id, source_path, vector_bytes) in rows {
                    match insert.execute(params![identity_id, source_path, vector_bytes, created]) {
                        Ok(_) => {}
                        Err(e) if is_constraint_violation(&e) => {
                            return Err(StoreError::IdentityNotFound(*identity_id));
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
            tx.execute(
                "UPDATE identities
                 SET enrollment_count = (SELECT COUNT(*) FROM embeddings WHERE identity_id = identities.id),
                     updated_at = ?1",
                [now()],
            )?;
            tx.commit()?;
            tracing::info!(removed, inserted = rows.len(), "replaced stored embeddings");
            Ok(rows.len())
        })
    }

    pub fn count_embeddings(&self) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }
}

impl Drop for IdentityStore {
    fn drop(&mut self) {
        self.close();
    }
}
