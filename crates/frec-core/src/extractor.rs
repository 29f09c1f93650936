//! ArcFace embedding extractor via ONNX Runtime.
//!
//! Turns a face crop into an L2-normalized feature vector. The vector length
//! is whatever the loaded model produces; it is read from a warm-up run at
//! load time rather than assumed.

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: usize = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 128.0;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("embedding model not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face image")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a face crop to a fixed-length, unit-norm embedding.
pub trait EmbeddingModel: Send {
    /// Length of every vector returned by [`EmbeddingModel::embed`].
    fn dimension(&self) -> usize;

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, ExtractorError>;
}

/// ArcFace-family extractor backed by an ONNX session.
pub struct ArcFaceExtractor {
    session: Session,
    dimension: usize,
}

impl ArcFaceExtractor {
    /// Load the model and run one inference on a blank image to learn the
    /// embedding length.
    pub fn load(model_path: impl AsRef<Path>) -> Result<Self, ExtractorError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(ExtractorError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let mut extractor = Self { session, dimension: 0 };
        let probe = RgbImage::new(ARCFACE_INPUT_SIZE as u32, ARCFACE_INPUT_SIZE as u32);
        let warmup = extractor.infer(&preprocess(&probe))?;
        if warmup.is_empty() {
            return Err(ExtractorError::InferenceFailed("model produced an empty embedding".into()));
        }
        extractor.dimension = warmup.len();

        tracing::info!(
            path = %model_path.display(),
            dimension = extractor.dimension,
            "loaded ArcFace model"
        );
        Ok(extractor)
    }

    fn infer(&mut self, input: &Array4<f32>) -> Result<Vec<f32>, ExtractorError> {
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractorError::InferenceFailed(format!("embedding extraction: {e}")))?;
        Ok(raw.to_vec())
    }
}

impl EmbeddingModel for ArcFaceExtractor {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, ExtractorError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(ExtractorError::EmptyImage);
        }
        let mut values = self.infer(&preprocess(face))?;
        if values.len() != self.dimension {
            return Err(ExtractorError::InferenceFailed(format!(
                "expected {}-dim embedding, got {}",
                self.dimension,
                values.len()
            )));
        }
        l2_normalize(&mut values);
        Ok(values)
    }
}

/// Resize to 112x112 and normalize each channel to roughly [-1, 1], NCHW.
fn preprocess(face: &RgbImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE;
    let resized = image::imageops::resize(face, size as u32, size as u32, FilterType::Triangle);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        }
    }
    tensor
}

/// Scale `values` to unit length. Zero vectors are left untouched.
pub fn l2_normalize(values: &mut [f32]) {
    let norm = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter_mut().for_each(|x| *x /= norm);
    }
}
