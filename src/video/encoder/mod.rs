//! Video encoder implementations
//!
//! Only JPEG is produced: frames are re-encoded for MJPEG transport.

pub mod jpeg;

pub use jpeg::JpegEncoder;
