//! Pixel format conversion and scaling
//!
//! Everything downstream of a backend works on packed RGB24; this module
//! turns raw device buffers into RGB24 and fits frames to a capture target.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use serde::{Deserialize, Serialize};

use super::format::Resolution;
use super::frame::VideoFrame;
use crate::error::{AppError, Result};

/// How a decoded frame is fitted to the capture target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeMode {
    /// Stretch to the exact target size
    #[default]
    Fit,
    /// Keep aspect ratio, pad with black
    Letterbox,
    /// Keep aspect ratio, center-crop the overflow
    Crop,
}

impl std::str::FromStr for ResizeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fit" | "stretch" => Ok(ResizeMode::Fit),
            "letterbox" | "pad" => Ok(ResizeMode::Letterbox),
            "crop" | "fill" => Ok(ResizeMode::Crop),
            _ => Err(format!("Unknown resize mode: {}", s)),
        }
    }
}

/// Convert packed YUYV (4:2:2) to RGB24 using BT.601 limited range
pub fn yuyv_to_rgb24(yuyv: &[u8], resolution: Resolution) -> Result<Vec<u8>> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let expected = width * height * 2;
    if yuyv.len() < expected {
        return Err(AppError::VideoError(format!(
            "YUYV data too small: {} < {}",
            yuyv.len(),
            expected
        )));
    }

    let mut rgb = Vec::with_capacity(width * height * 3);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = (y as i32 - 16).max(0) * 298;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(c + 409 * e),
        clamp(c - 100 * d - 208 * e),
        clamp(c + 516 * d),
    ]
}

/// Fit a frame to `target`, keeping the sequence number.
/// Returns the input unchanged when it already matches.
pub fn fit_frame(frame: &VideoFrame, target: Resolution, mode: ResizeMode) -> VideoFrame {
    if frame.resolution == target {
        return frame.clone();
    }
    if target.is_empty() || frame.resolution.is_empty() {
        return VideoFrame::black(target, frame.sequence);
    }

    let Some(source) = frame.to_rgb_image() else {
        return VideoFrame::black(target, frame.sequence);
    };
    let fitted = match mode {
        ResizeMode::Fit => imageops::resize(&source, target.width, target.height, FilterType::Triangle),
        ResizeMode::Letterbox => letterbox(&source, target),
        ResizeMode::Crop => crop_fill(&source, target),
    };

    let mut out = VideoFrame::from_image(fitted, frame.sequence);
    out.capture_ts = frame.capture_ts;
    out
}

/// Scale factor and scaled size that fit `(w, h)` inside or around `target`
fn scaled_size(w: u32, h: u32, target: Resolution, cover: bool) -> (u32, u32) {
    let sx = target.width as f64 / w as f64;
    let sy = target.height as f64 / h as f64;
    let scale = if cover { sx.max(sy) } else { sx.min(sy) };
    let sw = ((w as f64 * scale).round() as u32).max(1);
    let sh = ((h as f64 * scale).round() as u32).max(1);
    (sw, sh)
}

fn letterbox(source: &RgbImage, target: Resolution) -> RgbImage {
    let (sw, sh) = scaled_size(source.width(), source.height(), target, false);
    let sw = sw.min(target.width);
    let sh = sh.min(target.height);
    let scaled = imageops::resize(source, sw, sh, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(target.width, target.height, Rgb([0, 0, 0]));
    let x = (target.width - sw) / 2;
    let y = (target.height - sh) / 2;
    imageops::replace(&mut canvas, &scaled, x as i64, y as i64);
    canvas
}

fn crop_fill(source: &RgbImage, target: Resolution) -> RgbImage {
    let (sw, sh) = scaled_size(source.width(), source.height(), target, true);
    let sw = sw.max(target.width);
    let sh = sh.max(target.height);
    let scaled = imageops::resize(source, sw, sh, FilterType::Triangle);
    let x = (sw - target.width) / 2;
    let y = (sh - target.height) / 2;
    imageops::crop_imm(&scaled, x, y, target.width, target.height).to_image()
}
