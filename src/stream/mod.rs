//! MJPEG-over-HTTP republishing of capture sources
//!
//! - `endpoint`: path to source table with per-endpoint frame and JPEG caches
//! - `http`: request head parsing
//! - `mjpeg`: multipart framing
//! - `server`: tokio accept loop

pub mod endpoint;
pub mod http;
pub mod mjpeg;
pub mod server;

pub use endpoint::{EncodedFrame, Endpoint, EndpointTable};
pub use mjpeg::{create_mjpeg_part, ClientGuard};
pub use server::{MjpegServer, ServerStatus};
