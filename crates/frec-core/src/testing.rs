//! Model-free stand-ins for the detector and embedding model, for tests in
//! this crate and in crates that enable the `test-util` feature.

use crate::detector::{DetectorError, FaceDetect};
use crate::extractor::{l2_normalize, EmbeddingModel, ExtractorError};
use crate::types::BoundingBox;
use image::RgbImage;

/// Embeds a crop as its normalized mean colour.
pub struct ColorModel;

impl EmbeddingModel for ColorModel {
    fn dimension(&self) -> usize {
        3
    }

    fn embed(&mut self, face: &RgbImage) -> Result<Vec<f32>, ExtractorError> {
        let mut sum = [0f32; 3];
        for p in face.pixels() {
            for c in 0..3 {
                sum[c] += p[c] as f32;
            }
        }
        let mut v = sum.to_vec();
        l2_normalize(&mut v);
        Ok(v)
    }
}

/// Reports the whole frame as one face unless the frame is black.
pub struct WholeFrameDetector;

impl FaceDetect for WholeFrameDetector {
    fn detect(&mut self, image: &RgbImage) -> Result<Vec<BoundingBox>, DetectorError> {
        if image.pixels().all(|p| p.0 == [0, 0, 0]) {
            return Ok(vec![]);
        }
        Ok(vec![BoundingBox::new(0.0, 0.0, image.width() as f32, image.height() as f32)])
    }
}

/// 100x100 image of one colour.
pub fn solid(rgb: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(100, 100, image::Rgb(rgb))
}
