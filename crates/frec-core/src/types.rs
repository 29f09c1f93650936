use image::RgbImage;
use serde::{Deserialize, Serialize};

/// Identity id reported when a face does not match anyone.
pub const NO_MATCH: i64 = -1;

/// Display name for unmatched faces.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence: 1.0,
            landmarks: None,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Grow the box by `margin` of its size on every side.
    pub fn expanded(&self, margin: f32) -> Self {
        let dx = self.width * margin;
        let dy = self.height * margin;
        Self {
            x: self.x - dx,
            y: self.y - dy,
            width: self.width + 2.0 * dx,
            height: self.height + 2.0 * dy,
            ..self.clone()
        }
    }

    /// Integer pixel rectangle clamped to a `width × height` image.
    /// Returns `None` when nothing of the box lies inside the image.
    pub fn to_rect(&self, width: u32, height: u32) -> Option<Rect> {
        let x0 = self.x.floor().max(0.0);
        let y0 = self.y.floor().max(0.0);
        let x1 = (self.x + self.width).ceil().min(width as f32);
        let y1 = (self.y + self.height).ceil().min(height as f32);
        if !(x1 > x0 && y1 > y0) {
            return None;
        }
        Some(Rect {
            x: x0 as u32,
            y: y0 as u32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Pixel rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Copy the pixels under `rect` into a new image.
pub fn crop(image: &RgbImage, rect: Rect) -> RgbImage {
    image::imageops::crop_imm(image, rect.x, rect.y, rect.width, rect.height).to_image()
}

/// Outcome of matching one face against the index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Recognition {
    /// Matched identity, or [`NO_MATCH`].
    pub identity_id: i64,
    /// Similarity in [0, 1]. Reported even when below the threshold.
    pub confidence: f32,
}

impl Recognition {
    pub fn unknown(confidence: f32) -> Self {
        Self {
            identity_id: NO_MATCH,
            confidence,
        }
    }

    pub fn is_match(&self) -> bool {
        self.identity_id != NO_MATCH
    }
}

/// A face found in one frame, possibly labelled with an identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub identity_id: i64,
    pub display_name: String,
    pub confidence: f32,
}

impl DetectedFace {
    pub fn unknown(bbox: BoundingBox) -> Self {
        Self {
            bbox,
            identity_id: NO_MATCH,
            display_name: UNKNOWN_NAME.to_string(),
            confidence: 0.0,
        }
    }

    pub fn is_known(&self) -> bool {
        self.identity_id != NO_MATCH
    }

    pub fn mark_unknown(&mut self, confidence: f32) {
        self.identity_id = NO_MATCH;
        self.display_name = UNKNOWN_NAME.to_string();
        self.confidence = confidence;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_rect_clamps_to_image() {
        let b = BoundingBox::new(-10.0, 5.0, 50.0, 200.0);
        let r = b.to_rect(100, 100).unwrap();
        assert_eq!(r, Rect { x: 0, y: 5, width: 40, height: 95 });
    }

    #[test]
    fn test_to_rect_outside_image() {
        let b = BoundingBox::new(120.0, 10.0, 30.0, 30.0);
        assert!(b.to_rect(100, 100).is_none());
        let empty = BoundingBox::new(10.0, 10.0, 0.0, 0.0);
        assert!(empty.to_rect(100, 100).is_none());
    }

    #[test]
    fn test_expanded_margin() {
        let b = BoundingBox::new(100.0, 100.0, 50.0, 80.0).expanded(0.1);
        assert!((b.x - 95.0).abs() < 1e-4);
        assert!((b.y - 92.0).abs() < 1e-4);
        assert!((b.width - 60.0).abs() < 1e-4);
        assert!((b.height - 96.0).abs() < 1e-4);
    }

    #[test]
    fn test_crop_dimensions() {
        let img = RgbImage::from_pixel(64, 48, image::Rgb([1, 2, 3]));
        let out = crop(&img, Rect { x: 10, y: 8, width: 20, height: 30 });
        assert_eq!(out.dimensions(), (20, 30));
        assert_eq!(out.get_pixel(0, 0), &image::Rgb([1, 2, 3]));
    }

    #[test]
    fn test_detected_face_unknown() {
        let mut face = DetectedFace::unknown(BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        assert!(!face.is_known());
        face.identity_id = 4;
        face.display_name = "A1".into();
        face.mark_unknown(0.3);
        assert_eq!(face.display_name, UNKNOWN_NAME);
        assert_eq!(face.confidence, 0.3);
    }
}
