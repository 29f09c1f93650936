//! Background training worker.
//!
//! Requests go through a one-slot channel; a second request while one is
//! pending or running is refused instead of queued.

use crate::context::AppContext;
use frec_core::TrainingStats;
use frec_proto::{StreamRecord, TrainingCompleted, TrainingProgress};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TrainerError {
    #[error("Training already in progress")]
    InProgress,
    #[error("training worker is not running")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainRequest {
    /// Re-embed everything under the dataset directory.
    Dataset,
    /// Rebuild the index from stored embeddings.
    Store,
}

/// Clone-safe handle to the training thread.
#[derive(Clone)]
pub struct TrainerHandle {
    tx: mpsc::Sender<TrainRequest>,
    busy: Arc<AtomicBool>,
}

impl TrainerHandle {
    /// True from the moment a request is accepted until its run finishes.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn request(&self, request: TrainRequest) -> Result<(), TrainerError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(TrainerError::InProgress);
        }
        self.tx.try_send(request).map_err(|e| {
            self.busy.store(false, Ordering::SeqCst);
            match e {
                mpsc::error::TrySendError::Full(_) => TrainerError::InProgress,
                mpsc::error::TrySendError::Closed(_) => TrainerError::Stopped,
            }
        })
    }
}

/// Spawn the training worker. It exits once every handle is dropped.
pub fn spawn_trainer(ctx: Arc<AppContext>) -> std::io::Result<(TrainerHandle, JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::channel::<TrainRequest>(1);
    let busy = Arc::new(AtomicBool::new(false));
    let worker_busy = Arc::clone(&busy);

    let thread = std::thread::Builder::new()
        .name("frec-trainer".into())
        .spawn(move || {
            tracing::info!("training worker started");
            while let Some(request) = rx.blocking_recv() {
                run_training(&ctx, request);
                worker_busy.store(false, Ordering::SeqCst);
            }
            tracing::info!("training worker exiting");
        })?;

    Ok((TrainerHandle { tx, busy }, thread))
}

fn run_training(ctx: &AppContext, request: TrainRequest) {
    ctx.emit(StreamRecord::TrainingStarted);
    let stats = match request {
        TrainRequest::Dataset => {
            let root = &ctx.config.dataset_dir;
            let validation = ctx.training.validate_dataset(root);
            if validation.success {
                ctx.emit(StreamRecord::TrainingProgress(TrainingProgress {
                    current: 0,
                    total: validation.total_images as u32,
                    message: format!("embedding {} identities", validation.total_identities),
                }));
            }
            ctx.training.train_from_filesystem(root)
        }
        TrainRequest::Store => ctx.training.train_from_store(),
    };
    finish(ctx, stats);
}

fn finish(ctx: &AppContext, stats: TrainingStats) {
    if stats.success {
        ctx.set_recognition_enabled(true);
        ctx.emit(StreamRecord::TrainingCompleted(TrainingCompleted {
            identities: stats.total_identities as u32,
            images: stats.total_images as u32,
        }));
    } else {
        // A failed run leaves any previous index in place.
        let trained = ctx.lock_engine().is_trained();
        ctx.set_recognition_enabled(trained);
        ctx.emit(StreamRecord::TrainingFailed(stats.error_message.clone()));
    }
    tracing::info!(status = %ctx.training.status_message(), duration_ms = stats.duration_ms, "training run finished");
    ctx.set_last_training(stats);
}
