//! JPEG encoder implementation
//!
//! Re-encodes decoded RGB24 frames for MJPEG transport using turbojpeg.

use bytes::Bytes;

use crate::error::{AppError, Result};
use crate::video::frame::{VideoFrame, CHANNELS};

/// JPEG encoder using turbojpeg
///
/// Note: This encoder is NOT thread-safe due to turbojpeg limitations.
/// Use it from a single thread or wrap in a Mutex.
pub struct JpegEncoder {
    compressor: turbojpeg::Compressor,
    quality: u8,
}

impl JpegEncoder {
    /// Create a new JPEG encoder with quality 1-100
    pub fn new(quality: u8) -> Result<Self> {
        let mut compressor = turbojpeg::Compressor::new()
            .map_err(|e| AppError::Jpeg(format!("Failed to create turbojpeg compressor: {}", e)))?;

        let quality = quality.clamp(1, 100);
        compressor
            .set_quality(quality as i32)
            .map_err(|e| AppError::Jpeg(format!("Failed to set JPEG quality: {}", e)))?;
        compressor
            .set_subsamp(turbojpeg::Subsamp::Sub2x2)
            .map_err(|e| AppError::Jpeg(format!("Failed to set chroma subsampling: {}", e)))?;

        Ok(Self {
            compressor,
            quality,
        })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Encode an RGB24 frame
    pub fn encode(&mut self, frame: &VideoFrame) -> Result<Bytes> {
        if frame.resolution.is_empty() {
            return Err(AppError::Jpeg(format!(
                "cannot encode empty frame {}",
                frame.resolution
            )));
        }

        let width = frame.width() as usize;
        let image = turbojpeg::Image {
            pixels: frame.data(),
            width,
            pitch: width * CHANNELS,
            height: frame.height() as usize,
            format: turbojpeg::PixelFormat::RGB,
        };

        let jpeg = self
            .compressor
            .compress_to_vec(image)
            .map_err(|e| AppError::Jpeg(format!("JPEG compression failed: {}", e)))?;

        Ok(Bytes::from(jpeg))
    }
}
