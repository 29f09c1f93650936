//! V4L2 camera capture via the `v4l` crate.

use crate::capture::FrameSource;
use crate::frame::{self, Frame, FrameError};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Resolution tried when the requested one is refused.
const FALLBACK_RESOLUTION: (u32, u32) = (640, 480);
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion: {0}")]
    Frame(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
    /// Packed 8-bit RGB.
    Rgb24,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            b"RGB3" => Some(Self::Rgb24),
            _ => None,
        }
    }

    /// Convert one raw buffer of this format to RGB.
    pub fn convert(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
            Self::Y16 => frame::y16_to_rgb(buf, width, height),
            Self::Rgb24 => frame::rgb24_to_rgb(buf, width, height),
        }
    }
}

/// V4L2 camera device handle with a lazily started MMAP stream.
pub struct Camera {
    // Dropped before `device`.
    stream: Option<MmapStream<'static>>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open `/dev/video<index>`.
    pub fn open_index(index: u32, width: u32, height: u32) -> Result<Self, CameraError> {
        Self::open(&format!("/dev/video{index}"), width, height)
    }

    /// Open a V4L2 camera device by path, asking for `width x height` first
    /// and falling back to 640x480.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut last_error = None;
        for (w, h) in [(width, height), FALLBACK_RESOLUTION] {
            match negotiate(&device, w, h) {
                Ok((fmt, pixel_format)) => {
                    tracing::info!(
                        width = fmt.width,
                        height = fmt.height,
                        fourcc = ?fmt.fourcc,
                        "negotiated format"
                    );
                    return Ok(Self {
                        stream: None,
                        device,
                        width: fmt.width,
                        height: fmt.height,
                        device_path: device_path.to_string(),
                        fourcc: fmt.fourcc,
                        pixel_format,
                    });
                }
                Err(e) => {
                    tracing::debug!(width = w, height = h, error = %e, "resolution refused");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CameraError::FormatNegotiationFailed("no resolution accepted".into())
        }))
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Stop streaming. The next read restarts it.
    pub fn stop_stream(&mut self) {
        self.stream = None;
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }
        devices
    }
}

/// Ask for YUYV at `width x height` and accept any format we can convert.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(v4l::Format, PixelFormat), CameraError> {
    let mut fmt = device.format().map_err(|e| {
        CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
    })?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = width;
    fmt.height = height;

    let negotiated = device.set_format(&fmt).map_err(|e| {
        CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
    })?;
    if negotiated.width == 0 || negotiated.height == 0 {
        return Err(CameraError::FormatNegotiationFailed("driver returned an empty frame size".into()));
    }
    let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format: {:?} (need YUYV, GREY, Y16 or RGB3)",
            negotiated.fourcc
        ))
    })?;
    Ok((negotiated, pixel_format))
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
            self.stream = Some(stream);
        }
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| CameraError::CaptureFailed("stream not started".into()))?;

        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;
        let image = format.convert(buf, width, height)?;
        Ok(Frame::new(image, meta.sequence))
    }
}
