//! MJPEG decoding: turbojpeg -> RGB24, plus JPEG boundary detection in byte streams.

use turbojpeg::{Decompressor, Image, PixelFormat as TJPixelFormat};

use crate::error::{AppError, Result};
use crate::video::format::Resolution;
use crate::video::frame::VideoFrame;

const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG decoder producing packed RGB24 frames
pub struct MjpegDecoder {
    decompressor: Decompressor,
}

impl MjpegDecoder {
    pub fn new() -> Result<Self> {
        let decompressor = Decompressor::new().map_err(|e| {
            AppError::VideoError(format!("Failed to create turbojpeg decoder: {}", e))
        })?;
        Ok(Self { decompressor })
    }

    /// Decode one JPEG image into a frame carrying `sequence`
    pub fn decode(&mut self, jpeg: &[u8], sequence: u64) -> Result<VideoFrame> {
        let header = self
            .decompressor
            .read_header(jpeg)
            .map_err(|e| AppError::Jpeg(format!("turbojpeg read_header failed: {}", e)))?;

        let pitch = header.width * 3;
        let mut image = Image {
            pixels: vec![0u8; header.height * pitch],
            width: header.width,
            pitch,
            height: header.height,
            format: TJPixelFormat::RGB,
        };

        self.decompressor
            .decompress(jpeg, image.as_deref_mut())
            .map_err(|e| AppError::Jpeg(format!("turbojpeg decode failed: {}", e)))?;

        let resolution = Resolution::new(header.width as u32, header.height as u32);
        VideoFrame::from_rgb(image.pixels, resolution, sequence)
    }
}

/// Position of the next JPEG start-of-image marker
pub fn find_soi(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|w| w == SOI)
}

/// Length of the complete JPEG image at the start of `data`.
///
/// `data` must begin with SOI. Walks marker segments rather than searching
/// for the first EOI, so embedded thumbnails do not end the image early.
/// Returns `None` when the image is not complete yet.
pub fn jpeg_length(data: &[u8]) -> Option<usize> {
    if !data.starts_with(&SOI) {
        return None;
    }
    let mut pos = 2;
    loop {
        // skip fill bytes before a marker
        while pos < data.len() && data[pos] == 0xFF && data.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        if pos + 1 >= data.len() {
            return None;
        }
        if data[pos] != 0xFF {
            // corrupt stream; fall back to the next EOI
            return find_eoi(data, pos);
        }
        let marker = data[pos + 1];
        match marker {
            0xD9 => return Some(pos + 2),
            0x01 | 0xD0..=0xD7 => pos += 2,
            _ => {
                let len = u16::from_be_bytes([*data.get(pos + 2)?, *data.get(pos + 3)?]) as usize;
                if len < 2 {
                    return find_eoi(data, pos + 2);
                }
                pos += 2 + len;
                if marker == 0xDA {
                    pos = skip_entropy_coded(data, pos)?;
                }
            }
        }
    }
}

/// Advance past entropy-coded data to the next real marker
fn skip_entropy_coded(data: &[u8], mut pos: usize) -> Option<usize> {
    while pos + 1 < data.len() {
        if data[pos] == 0xFF {
            let next = data[pos + 1];
            if next != 0x00 && !(0xD0..=0xD7).contains(&next) && next != 0xFF {
                return Some(pos);
            }
            pos += if next == 0xFF { 1 } else { 2 };
        } else {
            pos += 1;
        }
    }
    None
}

fn find_eoi(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])
        .map(|p| from + p + 2)
}

/// Byte ranges of every complete JPEG image in a concatenated MJPEG buffer
pub fn split_jpegs(data: &[u8]) -> Vec<std::ops::Range<usize>> {
    let mut ranges = Vec::new();
    let mut offset = 0;
    while let Some(start) = data.get(offset..).and_then(find_soi) {
        let begin = offset + start;
        match jpeg_length(&data[begin..]) {
            Some(len) => {
                ranges.push(begin..begin + len);
                offset = begin + len;
            }
            None => break,
        }
    }
    ranges
}
