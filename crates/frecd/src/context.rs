//! Shared daemon state handed to handlers and worker threads.

use crate::config::Config;
use frec_core::{RecognitionEngine, TrainingManager, TrainingStats};
use frec_hw::{Camera, CameraError, Capture, Frame, FrameSource};
use frec_proto::{FaceDetection, Settings, StreamRecord};
use frec_store::IdentityStore;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Opens a fresh frame source each time the camera is switched on.
pub trait CameraOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// `/dev/video<index>` at the configured resolution.
pub struct V4lCameraOpener {
    pub index: u32,
    pub width: u32,
    pub height: u32,
}

impl CameraOpener for V4lCameraOpener {
    fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::open_index(self.index, self.width, self.height)?;
        tracing::info!(
            device = %camera.device_path,
            width = camera.width,
            height = camera.height,
            format = ?camera.pixel_format(),
            "camera opened"
        );
        Ok(Box::new(camera))
    }
}

/// Latest labelled faces published by the pipeline driver.
#[derive(Debug, Clone, Default)]
pub struct RecognitionFeed {
    pub faces: Vec<FaceDetection>,
    pub updated: Option<Instant>,
}

pub struct AppContext {
    pub config: Config,
    pub engine: Arc<Mutex<RecognitionEngine>>,
    pub store: Option<Arc<IdentityStore>>,
    pub training: Arc<TrainingManager>,
    pub capture: Capture,
    camera: Box<dyn CameraOpener>,
    /// Set by `camera_on`, cleared by `camera_off`. Differs from
    /// `capture.is_active()` only after the capture thread gave up.
    camera_wanted: AtomicBool,
    recognition_enabled: AtomicBool,
    settings: Mutex<Settings>,
    latest_frame: Mutex<Option<Frame>>,
    feed: Mutex<RecognitionFeed>,
    fps_bits: AtomicU32,
    events: broadcast::Sender<StreamRecord>,
    last_training: Mutex<Option<TrainingStats>>,
    /// Serializes camera start/stop.
    camera_lock: Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl AppContext {
    pub fn new(
        config: Config,
        engine: Arc<Mutex<RecognitionEngine>>,
        store: Option<Arc<IdentityStore>>,
        camera: Box<dyn CameraOpener>,
    ) -> Self {
        let training = Arc::new(
            TrainingManager::new(Arc::clone(&engine)).with_min_images_per_identity(config.min_images_per_identity),
        );
        let settings = Settings {
            similarity_threshold: config.similarity_threshold,
            recognition_interval_ms: config.recognition_interval.as_millis().min(u32::MAX as u128) as u32,
            auto_train: config.auto_train,
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            capture: Capture::new(config.queue_capacity, config.max_camera_errors),
            config,
            engine,
            store,
            training,
            camera,
            camera_wanted: AtomicBool::new(false),
            recognition_enabled: AtomicBool::new(false),
            settings: Mutex::new(settings),
            latest_frame: Mutex::new(None),
            feed: Mutex::new(RecognitionFeed::default()),
            fps_bits: AtomicU32::new(0),
            events,
            last_training: Mutex::new(None),
            camera_lock: Mutex::new(()),
        }
    }

    pub fn lock_engine(&self) -> MutexGuard<'_, RecognitionEngine> {
        lock(&self.engine)
    }

    // --- camera ---

    /// Open the camera and start capturing. A no-op when already running.
    pub fn start_camera(&self) -> Result<(), String> {
        let _guard = lock(&self.camera_lock);
        if self.capture.is_active() {
            return Ok(());
        }
        let source = self.camera.open().map_err(|e| e.to_string())?;
        self.capture.start(source).map_err(|e| e.to_string())?;
        self.camera_wanted.store(true, Ordering::SeqCst);
        tracing::info!("camera started");
        Ok(())
    }

    /// Stop capturing and release the device. A no-op when already stopped.
    pub fn stop_camera(&self) {
        let _guard = lock(&self.camera_lock);
        self.camera_wanted.store(false, Ordering::SeqCst);
        self.capture.stop();
        lock(&self.latest_frame).take();
        *lock(&self.feed) = RecognitionFeed::default();
        self.fps_bits.store(0, Ordering::Relaxed);
        tracing::info!("camera stopped");
    }

    pub fn camera_running(&self) -> bool {
        self.capture.is_active()
    }

    /// True once, after the capture thread stopped on its own.
    pub fn take_camera_failure(&self) -> bool {
        !self.capture.is_active() && self.camera_wanted.swap(false, Ordering::SeqCst)
    }

    // --- recognition state ---

    pub fn recognition_enabled(&self) -> bool {
        self.recognition_enabled.load(Ordering::SeqCst)
    }

    pub fn set_recognition_enabled(&self, enabled: bool) {
        self.recognition_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn settings(&self) -> Settings {
        *lock(&self.settings)
    }

    /// Store new settings and push the threshold into the engine.
    pub fn apply_settings(&self, settings: Settings) {
        self.lock_engine().set_threshold(settings.similarity_threshold);
        *lock(&self.settings) = settings;
        tracing::info!(
            threshold = settings.similarity_threshold,
            interval_ms = settings.recognition_interval_ms,
            auto_train = settings.auto_train,
            "settings updated"
        );
    }

    pub fn set_latest_frame(&self, frame: Frame) {
        *lock(&self.latest_frame) = Some(frame);
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        lock(&self.latest_frame).clone()
    }

    pub fn publish_feed(&self, faces: Vec<FaceDetection>) {
        *lock(&self.feed) = RecognitionFeed {
            faces,
            updated: Some(Instant::now()),
        };
    }

    pub fn feed(&self) -> RecognitionFeed {
        lock(&self.feed).clone()
    }

    pub fn set_fps(&self, fps: f32) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self) -> f32 {
        f32::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    // --- events ---

    /// Broadcast to every open binary stream. Dropped when nobody listens.
    pub fn emit(&self, record: StreamRecord) {
        let _ = self.events.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamRecord> {
        self.events.subscribe()
    }

    pub fn set_last_training(&self, stats: TrainingStats) {
        *lock(&self.last_training) = Some(stats);
    }

    pub fn last_training(&self) -> Option<TrainingStats> {
        lock(&self.last_training).clone()
    }

    /// Identity and embedding counts from the store, zero without one.
    pub fn counts(&self) -> (usize, usize) {
        let Some(store) = &self.store else {
            return (0, 0);
        };
        let people = store.count_identities().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to count identities");
            0
        });
        let faces = store.count_embeddings().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to count embeddings");
            0
        });
        (people, faces)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use frec_core::testing::{ColorModel, WholeFrameDetector};
    use frec_core::EngineConfig;
    use image::RgbImage;
    use std::path::Path;
    use std::time::Duration;

    /// Produces solid-colour frames until told to fail.
    pub(crate) struct FakeCamera {
        pub colour: [u8; 3],
        pub fail_after: Option<u32>,
    }

    struct FakeSource {
        colour: [u8; 3],
        remaining: Option<u32>,
        sequence: u32,
    }

    impl FrameSource for FakeSource {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(Duration::from_millis(5));
            if let Some(remaining) = self.remaining.as_mut() {
                if *remaining == 0 {
                    return Err(CameraError::CaptureFailed("unplugged".into()));
                }
                *remaining -= 1;
            }
            self.sequence += 1;
            Ok(Frame::new(RgbImage::from_pixel(120, 120, image::Rgb(self.colour)), self.sequence))
        }
    }

    impl CameraOpener for FakeCamera {
        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            Ok(Box::new(FakeSource {
                colour: self.colour,
                remaining: self.fail_after,
                sequence: 0,
            }))
        }
    }

    pub(crate) struct NoCamera;

    impl CameraOpener for NoCamera {
        fn open(&self) -> Result<Box<dyn FrameSource>, CameraError> {
            Err(CameraError::DeviceNotFound("/dev/video0".into()))
        }
    }

    pub(crate) fn test_context(dir: &Path, camera: Box<dyn CameraOpener>) -> Arc<AppContext> {
        let config = Config {
            socket_path: dir.join("frec.sock"),
            db_path: dir.join("faces.db"),
            index_path: dir.join("index.bin"),
            dataset_dir: dir.join("dataset"),
            min_face_size: 40,
            frame_skip: 1,
            recognition_interval: Duration::ZERO,
            stream_interval: Duration::from_millis(20),
            refresh_interval: Duration::from_millis(5),
            min_images_per_identity: 1,
            read_timeout: Duration::from_secs(5),
            ..Config::default()
        };
        let store = IdentityStore::open(&config.db_path).unwrap();
        store.initialize().unwrap();
        let store = Arc::new(store);

        let mut engine = RecognitionEngine::new(EngineConfig {
            threshold: config.similarity_threshold,
            min_face_size: config.min_face_size,
            index_path: config.index_path.clone(),
        });
        engine.set_model(Box::new(ColorModel));
        engine.set_detector(Box::new(WholeFrameDetector));
        engine.set_store(Arc::clone(&store));

        Arc::new(AppContext::new(config, Arc::new(Mutex::new(engine)), Some(store), camera))
    }

    #[test]
    fn test_camera_start_stop_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Box::new(FakeCamera { colour: [200, 0, 0], fail_after: None }));
        assert!(!ctx.camera_running());
        ctx.start_camera().unwrap();
        ctx.start_camera().unwrap();
        assert!(ctx.camera_running());
        ctx.stop_camera();
        ctx.stop_camera();
        assert!(!ctx.camera_running());
        assert!(!ctx.take_camera_failure());
    }

    #[test]
    fn test_camera_open_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Box::new(NoCamera));
        assert!(ctx.start_camera().unwrap_err().contains("/dev/video0"));
        assert!(!ctx.camera_running());
    }

    #[test]
    fn test_camera_failure_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Box::new(FakeCamera { colour: [1, 2, 3], fail_after: Some(1) }));
        ctx.start_camera().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ctx.camera_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(ctx.take_camera_failure());
        assert!(!ctx.take_camera_failure());
    }

    #[test]
    fn test_apply_settings_updates_engine() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Box::new(NoCamera));
        ctx.apply_settings(Settings {
            similarity_threshold: 0.9,
            recognition_interval_ms: 200,
            auto_train: false,
        });
        assert_eq!(ctx.lock_engine().threshold(), 0.9);
        assert_eq!(ctx.settings().recognition_interval_ms, 200);
        assert_eq!(ctx.counts(), (0, 0));
    }
}
