//! Configuration: serde schema plus a JSON file store

mod schema;
mod store;

pub use schema::{AppConfig, CaptureConfig, EndpointConfig, ScanConfig, ServerConfig};
pub use store::ConfigStore;
