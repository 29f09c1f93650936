use anyhow::{Context as _, Result};
use frec_core::{EngineConfig, FramePipeline, PipelineConfig, RecognitionEngine, ScrfdDetector};
use frec_store::IdentityStore;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

mod config;
mod context;
mod driver;
mod handlers;
mod server;
mod trainer;

use config::Config;
use context::{AppContext, V4lCameraOpener};
use driver::Driver;
use server::ControlServer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("frecd starting");
    let config = Config::from_env();

    let store = open_store(&config);
    if let Err(e) = std::fs::create_dir_all(&config.dataset_dir) {
        tracing::warn!(dir = %config.dataset_dir.display(), error = %e, "cannot create dataset directory");
    }

    let mut engine = RecognitionEngine::new(EngineConfig {
        threshold: config.similarity_threshold,
        min_face_size: config.min_face_size,
        index_path: config.index_path.clone(),
    });
    if let Some(store) = &store {
        engine.set_store(Arc::clone(store));
        if let Err(e) = engine.load_labels() {
            tracing::warn!(error = %e, "failed to load identity labels");
        }
    }

    let model_path = config.embedding_model_path();
    let model_loaded = match engine.load_model(&model_path) {
        Ok(()) => {
            tracing::info!(path = %model_path.display(), "embedding model loaded");
            true
        }
        Err(e) => {
            tracing::warn!(path = %model_path.display(), error = %e, "embedding model unavailable, recognition disabled");
            false
        }
    };

    let detector_path = config.detector_model_path();
    match ScrfdDetector::load(&detector_path) {
        Ok(detector) => engine.set_detector(Box::new(detector)),
        Err(e) => tracing::warn!(path = %detector_path.display(), error = %e, "face detector unavailable"),
    }

    let recognition_ready = model_loaded && restore_index(&mut engine, &config);
    let engine = Arc::new(Mutex::new(engine));

    let mut pipeline = FramePipeline::new(PipelineConfig {
        frame_skip: config.frame_skip,
        recognition_interval: config.recognition_interval,
        flip_horizontal: config.flip_horizontal,
        frame_scale: config.frame_scale,
        use_cache: true,
    });
    match ScrfdDetector::load(&detector_path) {
        Ok(detector) => pipeline.initialize(Box::new(detector), engine.clone()),
        Err(e) => tracing::warn!(error = %e, "frame pipeline disabled"),
    }

    let camera = Box::new(V4lCameraOpener {
        index: config.camera_device,
        width: config.camera_width,
        height: config.camera_height,
    });
    let ctx = Arc::new(AppContext::new(config, engine, store, camera));
    ctx.set_recognition_enabled(recognition_ready);

    let (trainer, _trainer_thread) =
        trainer::spawn_trainer(Arc::clone(&ctx)).context("failed to spawn training worker")?;
    let mut driver = Driver::spawn(Arc::clone(&ctx), pipeline).context("failed to spawn pipeline driver")?;

    let mut server = ControlServer::new(
        ctx.config.socket_path.clone(),
        ctx.config.max_connections,
        ctx.config.read_timeout,
    );
    handlers::register(&mut server, Arc::clone(&ctx), trainer);
    server.start()?;

    if ctx.config.camera_on_start {
        if let Err(e) = ctx.start_camera() {
            tracing::warn!(error = %e, "camera not started");
        }
    }

    tracing::info!(
        socket = %ctx.config.socket_path.display(),
        recognition = recognition_ready,
        "frecd ready"
    );

    wait_for_shutdown().await?;
    tracing::info!("frecd shutting down");

    server.stop();
    drop(server);
    driver.stop();
    ctx.stop_camera();
    if let Some(store) = &ctx.store {
        store.close();
    }

    Ok(())
}

fn open_store(config: &Config) -> Option<Arc<IdentityStore>> {
    if let Some(parent) = config.db_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            tracing::warn!(dir = %parent.display(), error = %e, "cannot create data directory");
        }
    }
    let opened = IdentityStore::open(&config.db_path).and_then(|store| {
        store.initialize()?;
        Ok(store)
    });
    match opened {
        Ok(store) => {
            tracing::info!(path = %config.db_path.display(), "identity store opened");
            Some(Arc::new(store))
        }
        Err(e) => {
            tracing::warn!(path = %config.db_path.display(), error = %e, "identity store unavailable");
            None
        }
    }
}

/// Persisted index first, then a rebuild from stored embeddings.
/// Returns whether the engine ended up trained.
fn restore_index(engine: &mut RecognitionEngine, config: &Config) -> bool {
    if config.index_path.exists() {
        match engine.load_index(&config.index_path) {
            Ok(entries) => {
                tracing::info!(path = %config.index_path.display(), entries, "similarity index loaded");
                if entries > 0 {
                    return true;
                }
            }
            Err(e) => tracing::warn!(
                path = %config.index_path.display(),
                error = %e,
                "cannot load similarity index, rebuilding from store"
            ),
        }
    }
    let has_embeddings = engine
        .store()
        .is_some_and(|store| store.count_embeddings().unwrap_or(0) > 0);
    if !has_embeddings {
        tracing::info!("no enrolled faces yet; capture photos to start recognizing");
        return false;
    }
    match engine.train_from_store() {
        Ok(summary) => {
            tracing::info!(identities = summary.identities, embeddings = summary.embeddings, "index rebuilt from store");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to rebuild index from store");
            false
        }
    }
}

async fn wait_for_shutdown() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
