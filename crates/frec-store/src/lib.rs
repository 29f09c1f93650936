//! frec-store — Durable identity storage.
//!
//! Keeps identities, enrollment-image provenance and raw embedding vectors
//! in a single SQLite database. The store is the source of truth for
//! identity naming; the recognition engine rebuilds its label maps from it.

mod schema;
pub mod store;
pub mod types;

pub use store::{IdentityStore, StoreError};
pub use types::{bytes_to_vector, vector_to_bytes, EmbeddingRecord, EnrollmentImage, Identity};
