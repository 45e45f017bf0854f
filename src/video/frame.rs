//! Decoded video frame

use bytes::Bytes;
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use super::format::Resolution;
use crate::error::{AppError, Result};

/// Bytes per pixel of a decoded frame (packed RGB24)
pub const CHANNELS: usize = 3;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Next frame sequence number. Shared by every handle in the process, so a
/// recreated source never repeats a number its predecessor published.
pub fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// A decoded RGB24 frame laid out as `height x width x 3`
///
/// Cloning is cheap: the pixel buffer is shared and never mutated.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    data: Bytes,
    /// Frame resolution
    pub resolution: Resolution,
    /// Process-wide sequence number, see [`next_sequence`]
    pub sequence: u64,
    /// Timestamp when frame was captured
    pub capture_ts: Instant,
}

impl VideoFrame {
    /// Wrap packed RGB24 bytes, checking the length against the resolution
    pub fn from_rgb(data: impl Into<Bytes>, resolution: Resolution, sequence: u64) -> Result<Self> {
        let data = data.into();
        let expected = resolution.pixels() as usize * CHANNELS;
        if data.len() != expected {
            return Err(AppError::VideoError(format!(
                "RGB24 buffer is {} bytes, expected {} for {}",
                data.len(),
                expected,
                resolution
            )));
        }
        Ok(Self {
            data,
            resolution,
            sequence,
            capture_ts: Instant::now(),
        })
    }

    /// All-black frame
    pub fn black(resolution: Resolution, sequence: u64) -> Self {
        Self::solid(resolution, [0, 0, 0], sequence)
    }

    /// Frame filled with a single color
    pub fn solid(resolution: Resolution, rgb: [u8; 3], sequence: u64) -> Self {
        let pixels = resolution.pixels() as usize;
        let data = if rgb == [0, 0, 0] {
            vec![0u8; pixels * CHANNELS]
        } else {
            rgb.iter().copied().cycle().take(pixels * CHANNELS).collect()
        };
        Self {
            data: Bytes::from(data),
            resolution,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    /// Build from an `image` RGB buffer
    pub fn from_image(image: RgbImage, sequence: u64) -> Self {
        let resolution = Resolution::new(image.width(), image.height());
        Self {
            data: Bytes::from(image.into_raw()),
            resolution,
            sequence,
            capture_ts: Instant::now(),
        }
    }

    /// Copy into an `image` RGB buffer
    pub fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width(), self.height(), self.data.to_vec())
    }

    /// Get frame data as bytes slice
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Same pixels under a new sequence number
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }

    /// Array shape `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.height() as usize, self.width() as usize, CHANNELS)
    }

    /// RGB value at `(x, y)`
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width() || y >= self.height() {
            return None;
        }
        let offset = (y as usize * self.width() as usize + x as usize) * CHANNELS;
        Some([self.data[offset], self.data[offset + 1], self.data[offset + 2]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_rgb_checks_length() {
        let res = Resolution::new(2, 2);
        assert!(VideoFrame::from_rgb(vec![0u8; 12], res, 0).is_ok());
        assert!(VideoFrame::from_rgb(vec![0u8; 11], res, 0).is_err());
    }

    #[test]
    fn test_solid_and_shape() {
        let frame = VideoFrame::solid(Resolution::new(4, 3), [10, 20, 30], 7);
        assert_eq!(frame.shape(), (3, 4, 3));
        assert_eq!(frame.pixel(3, 2), Some([10, 20, 30]));
        assert_eq!(frame.pixel(4, 0), None);
        assert_eq!(frame.sequence, 7);
    }

    #[test]
    fn test_zero_sized_frame() {
        let frame = VideoFrame::black(Resolution::new(0, 10), 0);
        assert!(frame.is_empty());
        assert_eq!(frame.shape(), (10, 0, 3));
    }
}
