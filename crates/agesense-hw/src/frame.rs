//! Frame type, pixel conversion (YUYV, RGB24, MJPEG) and the guide overlay.

use image::{Rgb, RgbImage};

/// Fraction of the shorter frame side covered by the guide square.
const GUIDE_FRACTION: f32 = 0.6;
const GUIDE_COLOR: Rgb<u8> = Rgb([0, 220, 90]);

/// A decoded RGB camera frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average luma (0.0–255.0), BT.601 weights.
    pub fn avg_brightness(&self) -> f32 {
        let count = self.image.width() as usize * self.image.height() as usize;
        if count == 0 {
            return 0.0;
        }
        let sum: f32 = self
            .image
            .pixels()
            .map(|p| 0.299 * p[0] as f32 + 0.587 * p[1] as f32 + 0.114 * p[2] as f32)
            .sum();
        sum / count as f32
    }
}

/// Rows of `row_bytes` out of a buffer whose rows start `stride` bytes
/// apart. A stride smaller than a row (0 from some drivers) means packed.
fn rows<'a>(
    buf: &'a [u8],
    row_bytes: usize,
    height: usize,
    stride: u32,
) -> Result<impl Iterator<Item = &'a [u8]> + 'a, FrameError> {
    let stride = (stride as usize).max(row_bytes);
    let expected = match height {
        0 => 0,
        h => stride * (h - 1) + row_bytes,
    };
    if buf.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: buf.len(),
        });
    }
    Ok((0..height).map(move |r| &buf[r * stride..r * stride + row_bytes]))
}

/// Convert YUYV (4:2:2) to RGB using BT.601 limited-range coefficients.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share
/// the chroma pair. `stride` is the driver's bytes-per-line.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32, stride: u32) -> Result<RgbImage, FrameError> {
    let (w, h) = (width as usize, height as usize);
    if width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected: w * h * 2,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in rows(yuyv, w * 2, h, stride)? {
        for chunk in row.chunks_exact(4) {
            let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
            rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
            rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
        }
    }

    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: w * h * 2,
        actual: yuyv.len(),
    })
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;

    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}

/// Copy an RGB24 buffer with `stride` bytes per line into an image.
pub fn rgb24_to_image(buf: &[u8], width: u32, height: u32, stride: u32) -> Result<RgbImage, FrameError> {
    let (w, h) = (width as usize, height as usize);
    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in rows(buf, w * 3, h, stride)? {
        rgb.extend_from_slice(row);
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected: w * h * 3,
        actual: buf.len(),
    })
}

/// Decode a Motion-JPEG buffer.
pub fn mjpeg_to_image(buf: &[u8]) -> Result<RgbImage, FrameError> {
    let decoded = image::load_from_memory_with_format(buf, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(decoded.to_rgb8())
}

/// Centered square guide drawn over the live view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuideRect {
    pub x: u32,
    pub y: u32,
    pub side: u32,
}

impl GuideRect {
    /// Guide geometry for a frame of the given size; `None` for empty frames.
    pub fn for_frame(width: u32, height: u32) -> Option<Self> {
        let short = width.min(height);
        if short == 0 {
            return None;
        }
        let side = ((short as f32 * GUIDE_FRACTION).round() as u32).max(1);
        Some(Self {
            x: (width - side) / 2,
            y: (height - side) / 2,
            side,
        })
    }
}

/// Outline the guide square on `image`, recomputed from its current size.
pub fn draw_guide(image: &mut RgbImage, thickness: u32) {
    let Some(rect) = GuideRect::for_frame(image.width(), image.height()) else {
        return;
    };
    let t = thickness.clamp(1, rect.side);
    let (x0, y0) = (rect.x, rect.y);
    let (x1, y1) = (rect.x + rect.side, rect.y + rect.side);

    for y in y0..y1 {
        for x in x0..x1 {
            let on_edge = x < x0 + t || x >= x1 - t || y < y0 + t || y >= y1 - t;
            if on_edge {
                image.put_pixel(x, y, GUIDE_COLOR);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
}
