//! frec-hw — Camera capture.
//!
//! V4L2 access through the `v4l` crate, conversion of raw buffers to RGB
//! frames, and a capture thread that feeds a drop-oldest frame queue.

pub mod camera;
pub mod capture;
pub mod frame;

pub use camera::{Camera, CameraError, PixelFormat};
pub use capture::{Capture, CaptureError, FrameQueue, FrameSource};
pub use frame::Frame;
