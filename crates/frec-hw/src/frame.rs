//! Frame type and raw pixel-format conversion to RGB.

use image::RgbImage;

/// A captured camera frame in RGB.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let n = (self.image.width() * self.image.height()) as f32;
        if n == 0.0 {
            return 0.0;
        }
        self.image.pixels().map(|p| luma(p.0)).sum::<f32>() / n
    }
}

fn luma([r, g, b]: [u8; 3]) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

fn check_len(buf: &[u8], expected: usize) -> Result<(), FrameError> {
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn from_raw(width: u32, height: u32, rgb: Vec<u8>) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 3) as usize;
    let actual = rgb.len();
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength { expected, actual })
}

fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

/// BT.601 YCbCr to RGB.
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as f32;
    let u = u as f32 - 128.0;
    let v = v as f32 - 128.0;
    [
        clamp_u8(y + 1.402 * v),
        clamp_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_u8(y + 1.772 * u),
    ]
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// Every 4 bytes `[Y0, U, Y1, V]` hold two pixels sharing one chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    check_len(yuyv, expected)?;
    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    from_raw(width, height, rgb)
}

/// Replicate 8-bit grey into three channels.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(grey, pixels)?;
    let rgb = grey[..pixels].iter().flat_map(|&g| [g, g, g]).collect();
    from_raw(width, height, rgb)
}

/// 16-bit little-endian grey, keeping the high byte.
pub fn y16_to_rgb(y16: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let pixels = (width * height) as usize;
    check_len(y16, pixels * 2)?;
    let rgb = y16[..pixels * 2]
        .chunks_exact(2)
        .flat_map(|c| {
            let g = (u16::from_le_bytes([c[0], c[1]]) >> 8) as u8;
            [g, g, g]
        })
        .collect();
    from_raw(width, height, rgb)
}

/// Packed RGB24, copied as-is.
pub fn rgb24_to_rgb(rgb: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let len = (width * height * 3) as usize;
    check_len(rgb, len)?;
    from_raw(width, height, rgb[..len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128] -> pure greys
        let img = yuyv_to_rgb(&[100, 128, 200, 128], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [100, 100, 100]);
        assert_eq!(img.get_pixel(1, 0).0, [200, 200, 200]);
    }

    #[test]
    fn test_yuyv_to_rgb_red_chroma() {
        let img = yuyv_to_rgb(&[76, 85, 76, 255], 2, 1).unwrap();
        let [r, g, b] = img.get_pixel(0, 0).0;
        assert!(r > 240 && g < 10 && b < 10, "got {r},{g},{b}");
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(matches!(
            yuyv_to_rgb(&[100, 128], 2, 1),
            Err(FrameError::InvalidLength { expected: 4, actual: 2 })
        ));
    }

    #[test]
    fn test_grey_and_y16() {
        let img = grey_to_rgb(&[7, 9], 2, 1).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [9, 9, 9]);

        let img = y16_to_rgb(&[0xff, 0x12, 0x00, 0x80], 2, 1).unwrap();
        assert_eq!(img.get_pixel(0, 0).0, [0x12, 0x12, 0x12]);
        assert_eq!(img.get_pixel(1, 0).0, [0x80, 0x80, 0x80]);
        assert!(y16_to_rgb(&[0; 3], 2, 1).is_err());
    }

    #[test]
    fn test_rgb24_copy_ignores_trailing_bytes() {
        let img = rgb24_to_rgb(&[1, 2, 3, 4, 5, 6, 99], 2, 1).unwrap();
        assert_eq!(img.get_pixel(1, 0).0, [4, 5, 6]);
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(RgbImage::from_pixel(4, 4, image::Rgb([100, 100, 100])), 0);
        assert!((frame.avg_brightness() - 100.0).abs() < 0.01);
        assert!(Frame::new(RgbImage::new(0, 0), 0).is_empty());
    }
}
