//! framecast - multi-source video capture with MJPEG-over-HTTP republishing
//!
//! Capture sources (V4L2 devices, MJPEG files, HTTP streams) are opened by
//! background threads that keep the latest frame at a fixed target size.
//! The MJPEG server republishes any of them under HTTP paths.

pub mod config;
pub mod error;
pub mod state;
pub mod stream;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
