//! frec-core — Face detection, embedding and recognition.
//!
//! SCRFD finds faces, an ArcFace-family model turns crops into embeddings,
//! and a flat similarity index matches them against enrolled identities.
//! Both models run via ONNX Runtime on the CPU.

pub mod dataset;
pub mod detector;
pub mod engine;
pub mod extractor;
pub mod index;
pub mod pipeline;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod training;
pub mod types;

use std::path::PathBuf;

pub use detector::{largest_face, DetectorError, FaceDetect, ScrfdDetector};
pub use engine::{EngineConfig, EngineError, RecognitionEngine, Recognizer, TrainingSummary};
pub use extractor::{ArcFaceExtractor, EmbeddingModel, ExtractorError};
pub use index::{distance_to_similarity, IndexError, SimilarityIndex};
pub use pipeline::{FramePipeline, PipelineConfig, PipelineError, PipelineStats, ProcessedFrame};
pub use training::{TrainingManager, TrainingStats};
pub use types::{BoundingBox, DetectedFace, Recognition, Rect, NO_MATCH, UNKNOWN_NAME};

/// File name of the SCRFD detector model inside the model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// File name of the embedding model inside the model directory.
pub const EMBEDDING_MODEL_FILE: &str = "w600k_r50.onnx";

/// Default model directory: `$XDG_DATA_HOME/frec/models`, falling back to
/// `~/.local/share/frec/models`, then `./models`.
pub fn default_model_dir() -> PathBuf {
    if let Ok(data) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data).join("frec/models");
    }
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".local/share/frec/models"),
        Err(_) => PathBuf::from("models"),
    }
}
