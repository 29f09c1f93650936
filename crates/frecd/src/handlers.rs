//! Command handlers. Each one takes the parsed text arguments and returns a
//! typed [`Response`]; the server renders it for whichever protocol the
//! client used.

use crate::context::AppContext;
use crate::server::{ControlServer, HandlerError, StreamSession, STREAM_COMMAND};
use crate::trainer::{TrainRequest, TrainerError, TrainerHandle};
use frec_core::{dataset, EngineError};
use frec_proto::{
    ErrorCode, FaceDetection, MultipleFaces, NoFace, PersonInfo, PersonList, Response, Settings, StatusReport,
    StreamRecord,
};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::TryRecvError;

type HandlerResult = Result<Response, HandlerError>;

/// Wire every command into the server's table.
pub fn register(server: &mut ControlServer, ctx: Arc<AppContext>, trainer: TrainerHandle) {
    let c = Arc::clone(&ctx);
    server.register_command("camera_on", move |_| camera_on(&c));
    let c = Arc::clone(&ctx);
    server.register_command("camera_off", move |_| camera_off(&c));
    let c = Arc::clone(&ctx);
    server.register_command("capture", move |args| capture(&c, args));

    for name in ["train", "registering"] {
        let t = trainer.clone();
        server.register_command(name, move |_| train(&t));
    }

    let (c, t) = (Arc::clone(&ctx), trainer.clone());
    server.register_command("status", move |_| status(&c, &t));
    let c = Arc::clone(&ctx);
    server.register_command("list", move |_| list(&c));
    let (c, t) = (Arc::clone(&ctx), trainer);
    server.register_command("delete", move |args| delete(&c, &t, args));
    let c = Arc::clone(&ctx);
    server.register_command("settings", move |_| Ok(Response::Settings(c.settings())));
    let c = Arc::clone(&ctx);
    server.register_command("set_settings", move |args| set_settings(&c, args));

    server.register_streaming_command(STREAM_COMMAND, move |session| stream_recognition(&ctx, session));
}

fn camera_on(ctx: &AppContext) -> HandlerResult {
    match ctx.start_camera() {
        Ok(()) => Ok(Response::Success("Camera started".into())),
        Err(e) => {
            tracing::error!(error = %e, "failed to start camera");
            Err(HandlerError::new(ErrorCode::CameraDeviceError, "Failed to start camera"))
        }
    }
}

fn camera_off(ctx: &AppContext) -> HandlerResult {
    ctx.stop_camera();
    Ok(Response::Success("Camera stopped".into()))
}

/// `<Initial><id>` from the raw capture arguments.
fn identity_name(args: &[String]) -> Result<String, HandlerError> {
    let (initial, id) = match args {
        [initial, id, ..] if !initial.is_empty() && !id.is_empty() => (initial, id),
        _ => {
            return Err(HandlerError::new(
                ErrorCode::InvalidParameters,
                "Missing arguments. Usage: capture:A:1",
            ))
        }
    };
    if id.parse::<u64>().is_err() {
        return Err(HandlerError::new(ErrorCode::InvalidParameters, "Invalid ID. Must be numeric."));
    }
    if !initial.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(HandlerError::new(
            ErrorCode::InvalidParameters,
            "Invalid initial. Must be alphanumeric.",
        ));
    }
    let mut chars = initial.chars();
    let first = chars.next().map(|c| c.to_ascii_uppercase()).unwrap_or_default();
    Ok(format!("{first}{}{id}", chars.as_str()))
}

fn capture(ctx: &AppContext, args: &[String]) -> HandlerResult {
    if !ctx.camera_running() {
        return Err(HandlerError::new(ErrorCode::CameraNotRunning, "Camera not running"));
    }
    let name = identity_name(args)?;
    let capture_failed = || HandlerError::new(ErrorCode::CaptureFailed, "Failed to capture photo");

    let frame = ctx.latest_frame().ok_or_else(capture_failed)?;
    let dir = ctx.config.dataset_dir.join(&name);
    std::fs::create_dir_all(&dir).map_err(|e| {
        tracing::error!(dir = %dir.display(), error = %e, "cannot create identity directory");
        capture_failed()
    })?;
    let path = dataset::next_image_path(&dir);
    frame.image.save(&path).map_err(|e| {
        tracing::error!(path = %path.display(), error = %e, "cannot save photo");
        capture_failed()
    })?;
    let source = path.to_string_lossy().into_owned();
    tracing::info!(name = %name, path = %source, "photo captured");

    let mut engine = ctx.lock_engine();
    let identity_id = engine.register_identity(&name).map_err(|e| {
        tracing::error!(name = %name, error = %e, "cannot register identity");
        HandlerError::new(ErrorCode::RegistrationFailed, "Failed to register person")
    })?;
    if let Some(store) = &ctx.store {
        if let Err(e) = store.add_enrollment_image(identity_id, &source) {
            tracing::warn!(identity_id, error = %e, "failed to record enrollment image");
        }
    }

    if !ctx.settings().auto_train {
        return Ok(Response::Success(format!("Photo captured - {name}")));
    }

    let face = match engine.crop_largest_face(&frame.image) {
        Ok(Some(face)) => face,
        Ok(None) => {
            return Err(HandlerError::new(ErrorCode::NoFaceDetected, "No face detected in captured photo"));
        }
        Err(e) => {
            tracing::error!(error = %e, "face detection failed");
            return Err(HandlerError::new(ErrorCode::EmbeddingFailed, "Failed to extract embedding"));
        }
    };
    match engine.add_incremental(&face, identity_id, &source) {
        Ok(()) => {}
        Err(e @ (EngineError::FaceTooSmall { .. } | EngineError::ModelNotLoaded | EngineError::Extractor(_))) => {
            tracing::error!(name = %name, error = %e, "embedding extraction failed");
            return Err(HandlerError::new(ErrorCode::EmbeddingFailed, "Failed to extract embedding"));
        }
        Err(e) => {
            tracing::error!(name = %name, error = %e, "incremental add failed");
            return Err(HandlerError::new(
                ErrorCode::RegistrationFailed,
                "Failed to add to recognition model",
            ));
        }
    }
    drop(engine);
    ctx.set_recognition_enabled(true);
    Ok(Response::Success(format!("Photo captured and person added - {name}")))
}

fn train(trainer: &TrainerHandle) -> HandlerResult {
    match trainer.request(TrainRequest::Dataset) {
        Ok(()) => Ok(Response::Success("Training started".into())),
        Err(TrainerError::InProgress) => Err(HandlerError::new(
            ErrorCode::TrainingInProgress,
            "Training already in progress",
        )),
        Err(e) => Err(HandlerError::new(ErrorCode::TrainingFailed, e.to_string())),
    }
}

fn status(ctx: &AppContext, trainer: &TrainerHandle) -> HandlerResult {
    let (people, faces) = ctx.counts();
    Ok(Response::Status(StatusReport {
        camera_running: ctx.camera_running(),
        recognition_enabled: ctx.recognition_enabled(),
        training_in_progress: trainer.is_busy() || ctx.training.is_training(),
        people_count: people as u32,
        total_faces: faces as u32,
        fps: ctx.fps(),
    }))
}

fn database_error(e: impl std::fmt::Display) -> HandlerError {
    tracing::error!(error = %e, "database error");
    HandlerError::new(ErrorCode::DatabaseError, format!("Database error: {e}"))
}

fn list(ctx: &AppContext) -> HandlerResult {
    let Some(store) = &ctx.store else {
        return Ok(Response::PersonList(PersonList::default()));
    };
    let mut persons = Vec::new();
    for identity in store.list_identities().map_err(database_error)? {
        let images = store.list_enrollment_images(identity.id).map_err(database_error)?;
        persons.push(PersonInfo {
            id: identity.id as u32,
            image_count: images.len() as u32,
            created_timestamp: identity.created_timestamp_ms(),
            name: identity.name,
        });
    }
    Ok(Response::PersonList(PersonList { persons }))
}

fn delete(ctx: &AppContext, trainer: &TrainerHandle, args: &[String]) -> HandlerResult {
    let name = match args.first() {
        Some(name) if !name.is_empty() => name,
        _ => {
            return Err(HandlerError::new(
                ErrorCode::InvalidParameters,
                "Missing arguments. Usage: delete:<name>",
            ))
        }
    };
    let store = ctx
        .store
        .as_ref()
        .ok_or_else(|| HandlerError::new(ErrorCode::DatabaseError, "Database not available"))?;
    let identity = store
        .get_identity_by_name(name)
        .map_err(database_error)?
        .ok_or_else(|| HandlerError::new(ErrorCode::PersonNotFound, format!("Person not found: {name}")))?;
    if trainer.is_busy() || ctx.training.is_training() {
        return Err(HandlerError::new(
            ErrorCode::TrainingInProgress,
            "Training already in progress",
        ));
    }

    store.delete_identity(identity.id).map_err(database_error)?;
    remove_identity_dir(&ctx.config.dataset_dir, name);

    let remaining = store.count_embeddings().map_err(database_error)?;
    if remaining == 0 {
        let mut engine = ctx.lock_engine();
        engine.clear();
        if let Err(e) = engine.load_labels() {
            tracing::warn!(error = %e, "failed to reload identity labels");
        }
        if let Err(e) = std::fs::remove_file(engine.index_path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(error = %e, "cannot remove index file");
            }
        }
        ctx.set_recognition_enabled(false);
        tracing::info!("last enrolled face deleted, index cleared");
    } else if let Err(e) = trainer.request(TrainRequest::Store) {
        // Someone else grabbed the worker; rebuild here instead.
        tracing::warn!(error = %e, "background rebuild not queued after delete");
        let mut engine = ctx.lock_engine();
        match engine.retrain() {
            Ok(summary) => tracing::info!(identities = summary.identities, "index rebuilt after delete"),
            Err(e) => tracing::warn!(error = %e, "index rebuild after delete failed"),
        }
        ctx.set_recognition_enabled(engine.is_trained());
    }

    tracing::info!(name = %name, id = identity.id, "person deleted");
    Ok(Response::Success(format!("Person deleted: {name}")))
}

/// Remove `<root>/<name>` so the next dataset training does not bring the
/// identity back. Names that are not a single path component are left alone.
fn remove_identity_dir(root: &Path, name: &str) {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(std::path::Component::Normal(_)), None)
    );
    if !single {
        return;
    }
    let dir = root.join(name);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => tracing::debug!(dir = %dir.display(), "identity images removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "cannot remove identity images"),
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

fn set_settings(ctx: &AppContext, args: &[String]) -> HandlerResult {
    let usage = || {
        HandlerError::new(
            ErrorCode::InvalidParameters,
            "Missing arguments. Usage: set_settings:0.70:1500:1",
        )
    };
    let [threshold, interval, auto_train, ..] = args else {
        return Err(usage());
    };
    let similarity_threshold: f32 = threshold.parse().map_err(|_| usage())?;
    if !(0.0..=1.0).contains(&similarity_threshold) {
        return Err(HandlerError::new(
            ErrorCode::InvalidParameters,
            "Threshold must be between 0 and 1",
        ));
    }
    let recognition_interval_ms: u32 = interval.parse().map_err(|_| usage())?;
    let auto_train = parse_flag(auto_train).ok_or_else(usage)?;

    ctx.apply_settings(Settings {
        similarity_threshold,
        recognition_interval_ms,
        auto_train,
    });
    Ok(Response::Success("Settings updated".into()))
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Current recognition state as one stream record.
fn current_record(ctx: &AppContext) -> StreamRecord {
    let timestamp_ms = now_ms();
    let mut faces: Vec<FaceDetection> = ctx.feed().faces;
    for face in &mut faces {
        face.timestamp_ms = timestamp_ms;
    }
    match faces.len() {
        0 => StreamRecord::NoFace(NoFace { timestamp_ms }),
        1 => StreamRecord::Face(faces.remove(0)),
        _ => StreamRecord::MultipleFaces(MultipleFaces { faces }),
    }
}

fn stream_recognition(ctx: &AppContext, session: &mut StreamSession<'_>) {
    let mut events = ctx.subscribe();
    tracing::info!(protocol = ?session.protocol(), "recognition stream opened");
    while session.is_active() && !session.client_done() {
        loop {
            match events.try_recv() {
                Ok(record) => {
                    if session.send(&record).is_err() {
                        tracing::info!("stream client disconnected");
                        return;
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => tracing::debug!(skipped, "stream lagged behind events"),
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        if ctx.camera_running() && session.send(&current_record(ctx)).is_err() {
            tracing::info!("stream client disconnected");
            return;
        }
        std::thread::sleep(ctx.config.stream_interval);
    }
    tracing::info!("recognition stream closed");
}
