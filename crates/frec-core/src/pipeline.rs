//! Per-frame pipeline: preprocess, detect, and recognize on a schedule.
//!
//! Detection runs on every frame. Recognition is expensive and runs only on
//! every `frame_skip`-th frame and no more often than the recognition
//! interval; in between, cached labels are applied to the new boxes by
//! position in the detection list.

use crate::detector::{DetectorError, FaceDetect};
use crate::engine::Recognizer;
use crate::types::{crop, DetectedFace};
use image::imageops::FilterType;
use image::RgbImage;
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;

pub type SharedRecognizer = Arc<Mutex<dyn Recognizer>>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline not initialized")]
    NotInitialized,
    #[error("empty frame")]
    EmptyFrame,
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Recognize on every n-th frame. 0 is treated as 1.
    pub frame_skip: u64,
    pub recognition_interval: Duration,
    pub flip_horizontal: bool,
    /// Scale applied before detection; 1.0 leaves frames untouched.
    pub frame_scale: f32,
    pub use_cache: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_skip: 3,
            recognition_interval: Duration::from_millis(1500),
            flip_horizontal: true,
            frame_scale: 1.0,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    /// The frame after flip and scale; boxes are in its coordinates.
    pub frame: RgbImage,
    pub faces: Vec<DetectedFace>,
    pub recognition_ran: bool,
    pub processing_time_ms: f64,
}

impl ProcessedFrame {
    pub fn detection_count(&self) -> usize {
        self.faces.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub faces_detected: u64,
    pub average_processing_time_ms: f64,
}

pub struct FramePipeline {
    config: PipelineConfig,
    detector: Option<Box<dyn FaceDetect>>,
    recognizer: Option<SharedRecognizer>,
    frame_counter: u64,
    last_recognition: Option<Instant>,
    cache: Vec<DetectedFace>,
    stats: PipelineStats,
}

impl FramePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            detector: None,
            recognizer: None,
            frame_counter: 0,
            last_recognition: None,
            cache: Vec::new(),
            stats: PipelineStats::default(),
        }
    }

    pub fn initialize(&mut self, detector: Box<dyn FaceDetect>, recognizer: SharedRecognizer) {
        self.detector = Some(detector);
        self.recognizer = Some(recognizer);
        tracing::debug!(config = ?self.config, "frame pipeline initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.detector.is_some()
    }

    pub fn set_frame_skip(&mut self, frame_skip: u64) {
        self.config.frame_skip = frame_skip;
    }

    pub fn set_recognition_interval(&mut self, interval: Duration) {
        self.config.recognition_interval = interval;
    }

    pub fn set_flip_horizontal(&mut self, flip: bool) {
        self.config.flip_horizontal = flip;
    }

    pub fn set_frame_scale(&mut self, scale: f32) {
        self.config.frame_scale = scale;
    }

    pub fn set_use_cache(&mut self, use_cache: bool) {
        self.config.use_cache = use_cache;
        if !use_cache {
            self.cache.clear();
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn reset_statistics(&mut self) {
        self.stats = PipelineStats::default();
    }

    /// Run one frame through the pipeline. With `recognition_enabled` off
    /// faces are only detected and the label cache is dropped.
    pub fn process(&mut self, frame: &RgbImage, recognition_enabled: bool) -> Result<ProcessedFrame, PipelineError> {
        if self.detector.is_none() {
            return Err(PipelineError::NotInitialized);
        }
        if frame.width() == 0 || frame.height() == 0 {
            return Err(PipelineError::EmptyFrame);
        }
        let started = Instant::now();
        self.frame_counter += 1;

        let frame = self.preprocess(frame);
        let boxes = match self.detector.as_mut() {
            Some(detector) => detector.detect(&frame)?,
            None => return Err(PipelineError::NotInitialized),
        };
        let mut faces: Vec<DetectedFace> = boxes.into_iter().map(DetectedFace::unknown).collect();

        let mut recognition_ran = false;
        if !recognition_enabled {
            self.cache.clear();
        } else if !faces.is_empty() {
            if self.recognition_due(started) {
                recognition_ran = self.recognize_faces(&frame, &mut faces, started);
            } else {
                self.apply_cache(&mut faces);
            }
        }

        let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.record(faces.len(), processing_time_ms);

        Ok(ProcessedFrame {
            frame,
            faces,
            recognition_ran,
            processing_time_ms,
        })
    }

    fn preprocess(&self, frame: &RgbImage) -> RgbImage {
        let mut out = if self.config.flip_horizontal {
            image::imageops::flip_horizontal(frame)
        } else {
            frame.clone()
        };
        let scale = self.config.frame_scale;
        if scale > 0.0 && (scale - 1.0).abs() > f32::EPSILON {
            let w = ((out.width() as f32 * scale).round() as u32).max(1);
            let h = ((out.height() as f32 * scale).round() as u32).max(1);
            out = image::imageops::resize(&out, w, h, FilterType::Triangle);
        }
        out
    }

    fn recognition_due(&self, now: Instant) -> bool {
        let skip = self.config.frame_skip.max(1);
        if self.frame_counter % skip != 0 {
            return false;
        }
        match self.last_recognition {
            None => true,
            Some(last) => now.duration_since(last) >= self.config.recognition_interval,
        }
    }

    /// Label `faces` using the shared recognizer. Returns whether a pass ran.
    fn recognize_faces(&mut self, frame: &RgbImage, faces: &mut [DetectedFace], now: Instant) -> bool {
        let Some(recognizer) = self.recognizer.clone() else {
            return false;
        };
        let mut engine = match recognizer.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                tracing::trace!("recognizer busy, reusing cached labels");
                self.apply_cache(faces);
                return false;
            }
        };

        if !engine.is_trained() {
            faces.iter_mut().for_each(|f| f.mark_unknown(0.0));
            self.cache.clear();
            return false;
        }

        for face in faces.iter_mut() {
            let Some(rect) = face.bbox.to_rect(frame.width(), frame.height()) else {
                face.mark_unknown(0.0);
                continue;
            };
            match engine.recognize(&crop(frame, rect)) {
                Ok(result) if result.is_match() => {
                    face.identity_id = result.identity_id;
                    face.display_name = engine.label_name(result.identity_id);
                    face.confidence = result.confidence;
                }
                Ok(result) => face.mark_unknown(result.confidence),
                Err(e) => {
                    tracing::debug!(error = %e, "recognition failed for face");
                    face.mark_unknown(0.0);
                }
            }
        }

        self.last_recognition = Some(now);
        if self.config.use_cache {
            self.cache = faces.to_vec();
        }
        true
    }

    /// Copy labels from the last recognition pass onto faces at the same
    /// position in the list.
    fn apply_cache(&self, faces: &mut [DetectedFace]) {
        if !self.config.use_cache {
            return;
        }
        for (face, cached) in faces.iter_mut().zip(&self.cache) {
            face.identity_id = cached.identity_id;
            face.display_name = cached.display_name.clone();
            face.confidence = cached.confidence;
        }
    }

    fn record(&mut self, faces: usize, processing_time_ms: f64) {
        let s = &mut self.stats;
        s.frames_processed += 1;
        s.faces_detected += faces as u64;
        let n = s.frames_processed as f64;
        s.average_processing_time_ms += (processing_time_ms - s.average_processing_time_ms) / n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use crate::types::{BoundingBox, Recognition, NO_MATCH, UNKNOWN_NAME};

    struct FixedDetector(Vec<BoundingBox>);

    impl FaceDetect for FixedDetector {
        fn detect(&mut self, _image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    /// Matches every crop to identity 1, except crops exactly 40 pixels wide
    /// which fail.
    struct CountingRecognizer {
        trained: bool,
        calls: usize,
    }

    impl Recognizer for CountingRecognizer {
        fn is_trained(&self) -> bool {
            self.trained
        }

        fn recognize(&mut self, face: &RgbImage) -> Result<Recognition, EngineError> {
            self.calls += 1;
            if face.width() == 40 {
                return Err(EngineError::ModelNotLoaded);
            }
            Ok(Recognition { identity_id: 1, confidence: 0.9 })
        }

        fn label_name(&self, identity_id: i64) -> String {
            if identity_id == 1 { "A1".into() } else { UNKNOWN_NAME.into() }
        }
    }

    fn setup(
        boxes: Vec<BoundingBox>,
        trained: bool,
        config: PipelineConfig,
    ) -> (FramePipeline, Arc<Mutex<CountingRecognizer>>) {
        let recognizer = Arc::new(Mutex::new(CountingRecognizer { trained, calls: 0 }));
        let mut pipeline = FramePipeline::new(config);
        pipeline.initialize(Box::new(FixedDetector(boxes)), recognizer.clone());
        (pipeline, recognizer)
    }

    fn every_frame() -> PipelineConfig {
        PipelineConfig {
            frame_skip: 1,
            recognition_interval: Duration::ZERO,
            flip_horizontal: false,
            ..PipelineConfig::default()
        }
    }

    fn frame() -> RgbImage {
        RgbImage::from_pixel(320, 240, image::Rgb([90, 90, 90]))
    }

    #[test]
    fn test_uninitialized_and_empty_frames() {
        let mut pipeline = FramePipeline::new(PipelineConfig::default());
        assert!(matches!(pipeline.process(&frame(), true), Err(PipelineError::NotInitialized)));

        let (mut pipeline, _) = setup(vec![], true, every_frame());
        assert!(matches!(pipeline.process(&RgbImage::new(0, 0), true), Err(PipelineError::EmptyFrame)));
        assert_eq!(pipeline.stats().frames_processed, 0);
    }

    #[test]
    fn test_recognition_runs_on_frame_skip_multiples() {
        let config = PipelineConfig { frame_skip: 5, ..every_frame() };
        let (mut pipeline, recognizer) = setup(vec![BoundingBox::new(10.0, 10.0, 100.0, 100.0)], true, config);

        let mut ran = Vec::new();
        for i in 1..=50u64 {
            let out = pipeline.process(&frame(), true).unwrap();
            if out.recognition_ran {
                ran.push(i);
            }
            // frames before the first pass have nothing cached
            if i >= 5 {
                assert_eq!(out.faces[0].display_name, "A1");
            }
        }
        assert_eq!(ran, vec![5, 10, 15, 20, 25, 30, 35, 40, 45, 50]);
        assert_eq!(recognizer.lock().unwrap().calls, 10);
        assert_eq!(pipeline.stats().frames_processed, 50);
        assert_eq!(pipeline.stats().faces_detected, 50);
    }

    #[test]
    fn test_recognition_interval_gates_passes() {
        let config = PipelineConfig {
            recognition_interval: Duration::from_secs(3600),
            ..every_frame()
        };
        let (mut pipeline, recognizer) = setup(vec![BoundingBox::new(0.0, 0.0, 100.0, 100.0)], true, config);
        for _ in 0..5 {
            pipeline.process(&frame(), true).unwrap();
        }
        assert_eq!(recognizer.lock().unwrap().calls, 1);
    }

    #[test]
    fn test_failed_face_does_not_abort_frame() {
        let boxes = vec![
            BoundingBox::new(0.0, 0.0, 40.0, 40.0),
            BoundingBox::new(100.0, 0.0, 50.0, 50.0),
        ];
        let (mut pipeline, _) = setup(boxes, true, every_frame());
        let out = pipeline.process(&frame(), true).unwrap();
        assert!(out.recognition_ran);
        assert_eq!(out.faces[0].identity_id, NO_MATCH);
        assert_eq!(out.faces[1].identity_id, 1);
        assert_eq!(out.faces[1].display_name, "A1");
        assert!((out.faces[1].confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_untrained_recognizer_clears_cache() {
        let (mut pipeline, recognizer) = setup(vec![BoundingBox::new(0.0, 0.0, 100.0, 100.0)], true, every_frame());
        assert_eq!(pipeline.process(&frame(), true).unwrap().faces[0].display_name, "A1");

        recognizer.lock().unwrap().trained = false;
        let out = pipeline.process(&frame(), true).unwrap();
        assert!(!out.recognition_ran);
        assert_eq!(out.faces[0].display_name, UNKNOWN_NAME);
        assert!(pipeline.cache.is_empty());
    }

    #[test]
    fn test_busy_recognizer_uses_cache() {
        let (mut pipeline, recognizer) = setup(vec![BoundingBox::new(0.0, 0.0, 100.0, 100.0)], true, every_frame());
        pipeline.process(&frame(), true).unwrap();

        let held = recognizer.lock().unwrap();
        let out = pipeline.process(&frame(), true).unwrap();
        assert!(!out.recognition_ran);
        assert_eq!(out.faces[0].display_name, "A1");
        drop(held);

        assert!(pipeline.process(&frame(), true).unwrap().recognition_ran);
    }

    #[test]
    fn test_disabled_recognition_leaves_faces_unknown() {
        let (mut pipeline, recognizer) = setup(vec![BoundingBox::new(0.0, 0.0, 100.0, 100.0)], true, every_frame());
        let out = pipeline.process(&frame(), false).unwrap();
        assert_eq!(out.faces[0].display_name, UNKNOWN_NAME);
        assert_eq!(recognizer.lock().unwrap().calls, 0);

        assert_eq!(pipeline.process(&frame(), true).unwrap().faces[0].display_name, "A1");
        assert!(!pipeline.cache.is_empty());
        let out = pipeline.process(&frame(), false).unwrap();
        assert!(!out.recognition_ran);
        assert_eq!(out.faces[0].display_name, UNKNOWN_NAME);
        assert!(pipeline.cache.is_empty());
    }

    #[test]
    fn test_flip_and_scale() {
        let mut img = RgbImage::from_pixel(100, 50, image::Rgb([0, 0, 0]));
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));

        let config = PipelineConfig { flip_horizontal: true, ..every_frame() };
        let (mut pipeline, _) = setup(vec![], true, config);
        let out = pipeline.process(&img, true).unwrap();
        assert_eq!(out.frame.get_pixel(99, 0), &image::Rgb([255, 0, 0]));

        pipeline.set_frame_scale(0.5);
        let out = pipeline.process(&img, true).unwrap();
        assert_eq!(out.frame.dimensions(), (50, 25));
    }

    #[test]
    fn test_stats_average_and_reset() {
        let (mut pipeline, _) = setup(vec![], true, every_frame());
        for _ in 0..4 {
            pipeline.process(&frame(), true).unwrap();
        }
        let stats = pipeline.stats();
        assert_eq!(stats.frames_processed, 4);
        assert!(stats.average_processing_time_ms >= 0.0);
        pipeline.reset_statistics();
        assert_eq!(pipeline.stats(), PipelineStats::default());
    }
}
