//! V4L2 color camera capture via the `v4l` crate.
//!
//! [`Camera::start`] negotiates a format and hands the device to a capture
//! thread that keeps decoding buffers into RGB; [`Camera::current_frame`]
//! returns whatever it decoded last.

use crate::frame::{self, Frame};
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Linux `EBUSY`.
const EBUSY: i32 = 16;
const STREAM_BUFFERS: u32 = 4;
/// How long `Drop` waits for the capture thread before detaching it.
const STOP_GRACE: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(10);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("camera permission denied: {0}")]
    PermissionDenied(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera feed not ready or dimensions unavailable")]
    FrameNotReady,
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
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb24,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(PixelFormat::Yuyv)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(PixelFormat::Rgb24)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(PixelFormat::Mjpeg)
        } else {
            None
        }
    }

    /// Decode one raw buffer into an RGB image. `stride` is bytes per line.
    pub fn decode(
        self,
        buf: &[u8],
        width: u32,
        height: u32,
        stride: u32,
    ) -> Result<RgbImage, frame::FrameError> {
        match self {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height, stride),
            PixelFormat::Rgb24 => frame::rgb24_to_image(buf, width, height, stride),
            PixelFormat::Mjpeg => frame::mjpeg_to_image(buf),
        }
    }
}

/// A live source of frames.
pub trait FrameSource: Send {
    /// Most recent decoded frame, or [`CameraError::FrameNotReady`] until
    /// the stream has produced one with nonzero dimensions.
    fn current_frame(&self) -> Result<Frame, CameraError>;

    /// Whether the stream is still delivering frames.
    fn is_active(&self) -> bool;
}

/// Acquires a camera stream on demand.
pub trait CameraProvider: Send + Sync {
    fn start(&self) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// Opens a V4L2 device at a preferred resolution.
#[derive(Debug, Clone)]
pub struct V4l2CameraProvider {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
}

impl CameraProvider for V4l2CameraProvider {
    fn start(&self) -> Result<Box<dyn FrameSource>, CameraError> {
        let camera = Camera::start(&self.device_path, self.width, self.height)?;
        Ok(Box::new(camera))
    }
}

/// Streaming V4L2 camera handle. Capture stops when dropped.
pub struct Camera {
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    latest: Arc<Mutex<Option<Frame>>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Camera {
    /// Open a V4L2 device (e.g., "/dev/video0"), request `width`×`height`
    /// and start continuous capture.
    ///
    /// The driver may negotiate a different size; the negotiated one is
    /// stored in `width`/`height`.
    pub fn start(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::Unavailable(format!("{device_path}: no such device")));
        }

        let device = Device::with_path(device_path).map_err(|e| classify_open_error(device_path, &e))?;

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

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;

        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, RGB3, or MJPG)"
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            stride = negotiated.stride,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let latest = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let latest = Arc::clone(&latest);
            let running = Arc::clone(&running);
            let layout = (negotiated.width, negotiated.height, negotiated.stride);
            std::thread::Builder::new()
                .name("agesense-capture".into())
                .spawn(move || capture_loop(device, pixel_format, layout, latest, running))
                .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?
        };

        Ok(Self {
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            latest,
            running,
            worker: Some(worker),
        })
    }

    /// Most recent decoded frame.
    pub fn current_frame(&self) -> Result<Frame, CameraError> {
        let slot = self.latest.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_ref() {
            Some(f) if f.width() > 0 && f.height() > 0 => Ok(f.clone()),
            _ => Err(CameraError::FrameNotReady),
        }
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::Acquire)
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

impl FrameSource for Camera {
    fn current_frame(&self) -> Result<Frame, CameraError> {
        Camera::current_frame(self)
    }

    fn is_active(&self) -> bool {
        Camera::is_active(self)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if !stop_worker(worker, STOP_GRACE) {
                tracing::warn!(
                    device = %self.device_path,
                    "capture thread still blocked in dequeue; detaching"
                );
            }
        }
    }
}

/// Join `worker` if it exits within `grace`, otherwise leave it detached.
///
/// A dequeue on a stalled device blocks with no timeout, so an unbounded
/// join could hang the caller. Returns whether the thread was joined.
fn stop_worker(worker: JoinHandle<()>, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    while !worker.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(STOP_POLL);
    }
    if worker.join().is_err() {
        tracing::warn!("capture thread panicked");
    }
    true
}

/// Map an open() failure to the camera error taxonomy.
fn classify_open_error(device_path: &str, e: &std::io::Error) -> CameraError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => {
            CameraError::PermissionDenied(format!("{device_path}: {e}"))
        }
        std::io::ErrorKind::NotFound => CameraError::Unavailable(format!("{device_path}: {e}")),
        _ if e.raw_os_error() == Some(EBUSY) => CameraError::DeviceBusy,
        _ => CameraError::Unavailable(format!("{device_path}: {e}")),
    }
}

/// Dequeue and decode buffers until asked to stop or the stream fails.
fn capture_loop(
    device: Device,
    pixel_format: PixelFormat,
    (width, height, stride): (u32, u32, u32),
    latest: Arc<Mutex<Option<Frame>>>,
    running: Arc<AtomicBool>,
) {
    let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to create mmap stream");
            running.store(false, Ordering::Release);
            return;
        }
    };

    tracing::info!(?pixel_format, width, height, stride, "capture thread started");

    while running.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(error = %e, "failed to dequeue buffer; stopping capture");
                break;
            }
        };

        match pixel_format.decode(buf, width, height, stride) {
            Ok(image) if image.width() > 0 && image.height() > 0 => {
                let frame = Frame {
                    image,
                    timestamp: std::time::Instant::now(),
                    sequence: meta.sequence,
                };
                *latest.lock().unwrap_or_else(|p| p.into_inner()) = Some(frame);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(seq = meta.sequence, error = %e, "skipping undecodable frame");
            }
        }
    }

    running.store(false, Ordering::Release);
    tracing::info!("capture thread exiting");
}
