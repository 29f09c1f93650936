//! Pipeline driver: pulls frames off the capture queue, runs them through
//! the frame pipeline and publishes the labelled faces for stream clients.

use crate::context::AppContext;
use frec_core::{DetectedFace, FramePipeline};
use frec_hw::Frame;
use frec_proto::{FaceDetection, StreamRecord};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const FPS_WINDOW: Duration = Duration::from_secs(1);

pub struct Driver {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Driver {
    pub fn spawn(ctx: Arc<AppContext>, pipeline: FramePipeline) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("frec-driver".into())
            .spawn(move || drive(&ctx, pipeline, &flag))?;
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("pipeline driver panicked");
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn drive(ctx: &AppContext, mut pipeline: FramePipeline, running: &AtomicBool) {
    tracing::info!(initialized = pipeline.is_initialized(), "pipeline driver started");
    let tick = ctx.config.refresh_interval.max(Duration::from_millis(1));
    let mut window_start = Instant::now();
    let mut window_frames = 0u32;

    while running.load(Ordering::SeqCst) {
        if ctx.take_camera_failure() {
            tracing::error!("camera stopped after repeated read errors");
            ctx.emit(StreamRecord::CameraError("camera stopped after repeated read errors".into()));
            ctx.stop_camera();
            pipeline.reset_statistics();
            continue;
        }

        let queue = ctx.capture.queue();
        let Some(mut frame) = queue.pop_timeout(tick) else {
            continue;
        };
        // Skip the backlog; only the newest frame matters.
        while let Some(newer) = queue.pop() {
            frame = newer;
        }

        let settings = ctx.settings();
        pipeline.set_recognition_interval(Duration::from_millis(settings.recognition_interval_ms as u64));
        let recognize = ctx.recognition_enabled() && !ctx.training.is_training();

        // Captures enroll from the same flipped and scaled image recognition sees.
        let mut latest = frame;
        if pipeline.is_initialized() {
            match pipeline.process(&latest.image, recognize) {
                Ok(processed) => {
                    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
                    let faces = processed.faces.iter().map(|f| to_detection(f, now)).collect();
                    ctx.publish_feed(faces);
                    latest = Frame::new(processed.frame, latest.sequence);
                }
                Err(e) => tracing::debug!(error = %e, "frame skipped"),
            }
        }
        ctx.set_latest_frame(latest);

        window_frames += 1;
        let elapsed = window_start.elapsed();
        if elapsed >= FPS_WINDOW {
            ctx.set_fps(window_frames as f32 / elapsed.as_secs_f32());
            window_start = Instant::now();
            window_frames = 0;
        }
    }
    let stats = pipeline.stats();
    tracing::info!(
        frames = stats.frames_processed,
        faces = stats.faces_detected,
        avg_ms = stats.average_processing_time_ms,
        "pipeline driver exiting"
    );
}

fn to_u16(v: f32) -> u16 {
    v.round().clamp(0.0, u16::MAX as f32) as u16
}

fn to_detection(face: &DetectedFace, timestamp_ms: u64) -> FaceDetection {
    FaceDetection {
        name: face.display_name.clone(),
        confidence: face.confidence,
        timestamp_ms,
        x: to_u16(face.bbox.x),
        y: to_u16(face.bbox.y),
        width: to_u16(face.bbox.width),
        height: to_u16(face.bbox.height),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::{test_context, FakeCamera};
    use frec_core::testing::WholeFrameDetector;
    use frec_core::{BoundingBox, PipelineConfig};

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_to_detection_clamps_box() {
        let mut face = DetectedFace::unknown(BoundingBox::new(-3.0, 10.4, 70000.0, 20.6));
        face.confidence = 0.5;
        let d = to_detection(&face, 9);
        assert_eq!((d.x, d.y, d.width, d.height), (0, 10, u16::MAX, 21));
        assert_eq!(d.name, "Unknown");
        assert_eq!(d.timestamp_ms, 9);
    }

    #[test]
    fn test_driver_publishes_faces() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Box::new(FakeCamera { colour: [10, 200, 10], fail_after: None }));
        let mut pipeline = FramePipeline::new(PipelineConfig {
            frame_skip: 1,
            recognition_interval: Duration::ZERO,
            ..PipelineConfig::default()
        });
        pipeline.initialize(Box::new(WholeFrameDetector), ctx.engine.clone());

        let mut driver = Driver::spawn(Arc::clone(&ctx), pipeline).unwrap();
        ctx.start_camera().unwrap();
        assert!(wait_until(|| ctx.feed().faces.len() == 1));
        assert!(ctx.latest_frame().is_some());
        assert_eq!(ctx.feed().faces[0].name, "Unknown");

        ctx.stop_camera();
        driver.stop();
    }

    #[test]
    fn test_latest_frame_is_the_processed_frame() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Box::new(FakeCamera { colour: [10, 200, 10], fail_after: None }));
        let mut pipeline = FramePipeline::new(PipelineConfig {
            frame_skip: 1,
            recognition_interval: Duration::ZERO,
            frame_scale: 0.5,
            ..PipelineConfig::default()
        });
        pipeline.initialize(Box::new(WholeFrameDetector), ctx.engine.clone());

        let mut driver = Driver::spawn(Arc::clone(&ctx), pipeline).unwrap();
        ctx.start_camera().unwrap();
        assert!(wait_until(|| ctx.latest_frame().is_some()));
        // camera frames are 120x120
        assert_eq!(ctx.latest_frame().unwrap().image.dimensions(), (60, 60));

        ctx.stop_camera();
        driver.stop();
    }

    #[test]
    fn test_uninitialized_pipeline_keeps_raw_frame() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Box::new(FakeCamera { colour: [10, 200, 10], fail_after: None }));
        let pipeline = FramePipeline::new(PipelineConfig {
            frame_scale: 0.5,
            ..PipelineConfig::default()
        });

        let mut driver = Driver::spawn(Arc::clone(&ctx), pipeline).unwrap();
        ctx.start_camera().unwrap();
        assert!(wait_until(|| ctx.latest_frame().is_some()));
        assert_eq!(ctx.latest_frame().unwrap().image.dimensions(), (120, 120));

        ctx.stop_camera();
        driver.stop();
    }

    #[test]
    fn test_driver_reports_camera_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path(), Box::new(FakeCamera { colour: [1, 1, 1], fail_after: Some(2) }));
        let mut events = ctx.subscribe();
        let mut driver = Driver::spawn(Arc::clone(&ctx), FramePipeline::new(PipelineConfig::default())).unwrap();
        ctx.start_camera().unwrap();

        assert!(wait_until(|| matches!(events.try_recv(), Ok(StreamRecord::CameraError(_)))));
        assert!(!ctx.camera_running());
        driver.stop();
    }
}
