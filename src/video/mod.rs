//! Video capture module
//!
//! Source handles poll capture backends (V4L2 devices, files, HTTP streams)
//! on their own threads; the registry keeps one handle per source.

pub mod backend;
pub mod convert;
pub mod decoder;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod handle;
pub mod registry;
pub mod scanner;
pub mod source;

pub use backend::{BackendKind, BackendSet, CaptureBackend, CaptureStream};
pub use convert::ResizeMode;
pub use device::{enumerate_devices, VideoDeviceInfo};
pub use encoder::JpegEncoder;
pub use format::{PixelFormat, Resolution};
pub use frame::VideoFrame;
pub use handle::{FrameSource, SourceHandle, SourceOptions, SourceStats};
pub use registry::{CaptureRequest, RegisteredSource, SourceRegistry};
pub use scanner::DeviceScanner;
pub use source::SourceId;
