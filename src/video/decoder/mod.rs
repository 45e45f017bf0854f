//! Video decoder implementations
//!
//! Compressed sources (MJPEG cameras, MJPEG files, HTTP MJPEG streams) are
//! decoded to RGB24 with libjpeg-turbo.

pub mod mjpeg;

pub use mjpeg::{find_soi, jpeg_length, split_jpegs, MjpegDecoder};
