//! agesense-hw — Hardware abstraction for live camera capture.
//!
//! Provides a V4L2 color camera that decodes frames on a background
//! thread, plus frame conversion and overlay helpers.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CameraProvider, FrameSource, PixelFormat, V4l2CameraProvider};
pub use frame::{Frame, GuideRect};
