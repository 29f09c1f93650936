//! Training orchestration on top of [`RecognitionEngine`].
//!
//! Only one run may be in flight; a second request fails fast instead of
//! queueing. The engine lock is held for the whole run, so recognition
//! callers that use `try_lock` skip their pass meanwhile.

use crate::dataset;
use crate::engine::{EngineError, RecognitionEngine, TrainingSummary};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

pub const DEFAULT_MIN_IMAGES_PER_IDENTITY: usize = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrainingStats {
    pub success: bool,
    pub total_identities: usize,
    pub total_images: usize,
    pub avg_images_per_identity: f32,
    pub error_message: String,
    pub duration_ms: u64,
}

impl TrainingStats {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            error_message: message.into(),
            ..Self::default()
        }
    }

    fn from_summary(summary: TrainingSummary) -> Self {
        Self {
            success: true,
            total_identities: summary.identities,
            total_images: summary.embeddings,
            avg_images_per_identity: average(summary.embeddings, summary.identities),
            ..Self::default()
        }
    }
}

fn average(images: usize, identities: usize) -> f32 {
    if identities == 0 {
        0.0
    } else {
        images as f32 / identities as f32
    }
}

/// Clears the in-progress flag when dropped.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct TrainingManager {
    engine: Arc<Mutex<RecognitionEngine>>,
    min_images_per_identity: usize,
    in_progress: AtomicBool,
    status: Mutex<String>,
}

impl TrainingManager {
    pub fn new(engine: Arc<Mutex<RecognitionEngine>>) -> Self {
        Self {
            engine,
            min_images_per_identity: DEFAULT_MIN_IMAGES_PER_IDENTITY,
            in_progress: AtomicBool::new(false),
            status: Mutex::new("idle".to_string()),
        }
    }

    pub fn with_min_images_per_identity(mut self, min: usize) -> Self {
        self.min_images_per_identity = min.max(1);
        self
    }

    pub fn is_training(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Human-readable description of the last or current run.
    pub fn status_message(&self) -> String {
        self.status.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_status(&self, message: impl Into<String>) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = message.into();
    }

    fn lock_engine(&self) -> MutexGuard<'_, RecognitionEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Option<RunGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(&self.in_progress))
    }

    fn run(
        &self,
        label: &str,
        train: impl FnOnce(&mut RecognitionEngine) -> Result<TrainingSummary, EngineError>,
    ) -> TrainingStats {
        let Some(_guard) = self.begin() else {
            return TrainingStats::failed("training already in progress");
        };
        let started = Instant::now();
        self.set_status(format!("training from {label}"));
        tracing::info!(source = label, "training started");

        let result = {
            let mut engine = self.lock_engine();
            train(&mut *engine)
        };
        let mut stats = match result {
            Ok(summary) => {
                self.set_status(format!(
                    "trained {} identities from {} images",
                    summary.identities, summary.embeddings
                ));
                TrainingStats::from_summary(summary)
            }
            Err(e) => {
                self.set_status(format!("training failed: {e}"));
                tracing::error!(source = label, error = %e, "training failed");
                TrainingStats::failed(e.to_string())
            }
        };
        stats.duration_ms = started.elapsed().as_millis() as u64;

        if stats.success {
            tracing::info!(
                source = label,
                identities = stats.total_identities,
                images = stats.total_images,
                duration_ms = stats.duration_ms,
                "training finished"
            );
        }
        stats
    }

    /// Validate the dataset layout, then train from it.
    pub fn train_from_filesystem(&self, root: &Path) -> TrainingStats {
        let validation = self.validate_dataset(root);
        if !validation.success {
            self.set_status(format!("dataset rejected: {}", validation.error_message));
            return validation;
        }
        self.run("filesystem", |engine| engine.train_from_directory(root))
    }

    pub fn train_from_store(&self) -> TrainingStats {
        self.run("store", |engine| engine.train_from_store())
    }

    /// Count identities and images under `root`.
    ///
    /// Identities below the per-identity minimum are reported but do not fail
    /// validation unless no identity meets it.
    pub fn validate_dataset(&self, root: &Path) -> TrainingStats {
        let dirs = match dataset::identity_dirs(root) {
            Ok(dirs) => dirs,
            Err(e) => return TrainingStats::failed(format!("cannot read {}: {e}", root.display())),
        };

        let mut stats = TrainingStats::default();
        let mut short = Vec::new();
        let mut sufficient = 0usize;
        for (name, dir) in dirs {
            let images = dataset::image_files(&dir).map(|f| f.len()).unwrap_or(0);
            if images == 0 {
                continue;
            }
            stats.total_identities += 1;
            stats.total_images += images;
            if images >= self.min_images_per_identity {
                sufficient += 1;
            } else {
                tracing::warn!(name = %name, images, min = self.min_images_per_identity, "identity has too few images");
                short.push(name);
            }
        }
        stats.avg_images_per_identity = average(stats.total_images, stats.total_identities);

        if sufficient == 0 {
            stats.error_message = if stats.total_identities == 0 {
                "dataset contains no images".to_string()
            } else {
                format!("no identity has at least {} images", self.min_images_per_identity)
            };
        } else {
            stats.success = true;
            if !short.is_empty() {
                stats.error_message = format!("too few images: {}", short.join(", "));
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{solid, ColorModel, WholeFrameDetector};
    use crate::engine::EngineConfig;
    use std::fs;

    fn manager(dir: &Path) -> TrainingManager {
        let mut engine = RecognitionEngine::new(EngineConfig {
            index_path: dir.join("index.bin"),
            ..EngineConfig::default()
        });
        engine.set_model(Box::new(ColorModel));
        engine.set_detector(Box::new(WholeFrameDetector));
        TrainingManager::new(Arc::new(Mutex::new(engine)))
    }

    fn add_images(root: &Path, name: &str, rgb: [u8; 3], count: usize) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for i in 0..count {
            solid(rgb).save(dir.join(format!("{i}.png"))).unwrap();
        }
    }

    #[test]
    fn test_validate_dataset_counts() {
        let dir = tempfile::tempdir().unwrap();
        add_images(dir.path(), "A1", [255, 0, 0], 3);
        add_images(dir.path(), "B2", [0, 0, 255], 1);
        fs::create_dir_all(dir.path().join("C3")).unwrap();

        let stats = manager(dir.path()).validate_dataset(dir.path());
        assert!(stats.success);
        assert_eq!(stats.total_identities, 2);
        assert_eq!(stats.total_images, 4);
        assert!((stats.avg_images_per_identity - 2.0).abs() < 1e-6);
        assert!(stats.error_message.contains("B2"));
    }

    #[test]
    fn test_validate_dataset_insufficient() {
        let dir = tempfile::tempdir().unwrap();
        add_images(dir.path(), "A1", [255, 0, 0], 1);
        let stats = manager(dir.path()).validate_dataset(dir.path());
        assert!(!stats.success);

        let missing = manager(dir.path()).validate_dataset(&dir.path().join("missing"));
        assert!(!missing.success);
        assert!(missing.error_message.contains("cannot read"));
    }

    #[test]
    fn test_train_from_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        add_images(&data, "A1", [255, 0, 0], 2);
        add_images(&data, "B2", [0, 0, 255], 2);

        let manager = manager(dir.path());
        let stats = manager.train_from_filesystem(&data);
        assert!(stats.success, "{}", stats.error_message);
        assert_eq!(stats.total_identities, 2);
        assert_eq!(stats.total_images, 4);
        assert!(!manager.is_training());
        assert!(manager.status_message().starts_with("trained 2 identities"));
        assert!(manager.engine.lock().unwrap().is_trained());
    }

    #[test]
    fn test_concurrent_training_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let guard = manager.begin().unwrap();
        assert!(manager.is_training());

        let stats = manager.train_from_store();
        assert!(!stats.success);
        assert_eq!(stats.error_message, "training already in progress");

        drop(guard);
        assert!(!manager.is_training());
    }

    #[test]
    fn test_train_from_store_without_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let stats = manager.train_from_store();
        assert!(!stats.success);
        assert!(manager.status_message().starts_with("training failed"));
        assert!(!manager.is_training());
    }
}
