use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::video::{BackendKind, ResizeMode};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Defaults for every source handle
    pub capture: CaptureConfig,
    /// MJPEG HTTP server settings
    pub server: ServerConfig,
    /// Startup device scan
    pub scan: ScanConfig,
    /// Endpoints registered at startup
    pub endpoints: Vec<EndpointConfig>,
}

impl AppConfig {
    /// Reject values the capture loop or server cannot run with
    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;
        self.server.validate()?;
        for endpoint in &self.endpoints {
            endpoint.validate()?;
        }
        Ok(())
    }
}

/// Source handle defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Target width
    pub width: u32,
    /// Target height
    pub height: u32,
    /// Requested frame rate; sources report their own when unset
    pub fps: Option<f64>,
    /// How decoded frames are fitted to the target size
    pub mode: ResizeMode,
    /// Backend preference list, tried in order
    pub backends: Vec<BackendKind>,
    /// Wait after a successful open, in milliseconds
    pub settle_ms: u64,
    /// Closed time before a reopen attempt, in milliseconds
    pub stall_timeout_ms: u64,
    /// Bounded wait for a capture thread on teardown, in milliseconds
    pub join_timeout_ms: u64,
    /// Playback rate of file sources
    pub file_fps: f64,
    /// Connect timeout of HTTP sources, in milliseconds
    pub http_connect_timeout_ms: u64,
    /// V4L2 mmap buffer count
    pub v4l2_buffer_count: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            fps: None,
            mode: ResizeMode::Fit,
            backends: vec![BackendKind::Any],
            settle_ms: 1000,
            stall_timeout_ms: 2000,
            join_timeout_ms: 1000,
            file_fps: 30.0,
            http_connect_timeout_ms: 5000,
            v4l2_buffer_count: 2,
        }
    }
}

impl CaptureConfig {
    pub fn http_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.http_connect_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if let Some(fps) = self.fps {
            if !(fps.is_finite() && fps > 0.0) {
                return Err(AppError::Config(format!("capture.fps must be positive, got {}", fps)));
            }
        }
        if !(self.file_fps.is_finite() && self.file_fps > 0.0) {
            return Err(AppError::Config(format!(
                "capture.file_fps must be positive, got {}",
                self.file_fps
            )));
        }
        Ok(())
    }
}

/// MJPEG HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub enabled: bool,
    /// Bind address
    pub bind: String,
    pub port: u16,
    /// JPEG quality (1-100) of re-encoded frames
    pub jpeg_quality: u8,
    /// Endpoint cache refresh period, in milliseconds
    pub refresh_interval_ms: u64,
    /// Maximum gap between parts sent to a viewer, in milliseconds
    pub keepalive_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 7227,
            jpeg_quality: 80,
            refresh_interval_ms: 5,
            keepalive_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(AppError::Config(format!(
                "server.jpeg_quality must be within 1-100, got {}",
                self.jpeg_quality
            )));
        }
        Ok(())
    }
}

/// Startup device scan
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Run a scan when the service starts
    pub on_startup: bool,
    /// Open each index while scanning
    pub probe: bool,
    /// Indices `0..max_index` are scanned
    pub max_index: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            on_startup: false,
            probe: false,
            max_index: 5,
        }
    }
}

/// HTTP path served from a capture source
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Request path, matched case-insensitively
    pub path: String,
    /// Device index, file path or URL
    pub source: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    /// Single backend to open the source with
    pub backend: Option<BackendKind>,
}

impl EndpointConfig {
    /// Parse a `PATH=SOURCE` command line mapping
    pub fn parse_mapping(raw: &str) -> Result<Self> {
        let (path, source) = raw
            .split_once('=')
            .ok_or_else(|| AppError::Config(format!("expected PATH=SOURCE, got '{}'", raw)))?;
        let endpoint = Self {
            path: path.trim().to_string(),
            source: source.trim().to_string(),
            ..Self::default()
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    fn validate(&self) -> Result<()> {
        if self.path.trim().is_empty() {
            return Err(AppError::Config("endpoint path must not be empty".to_string()));
        }
        if self.source.trim().is_empty() {
            return Err(AppError::Config(format!(
                "endpoint {} has no source",
                self.path
            )));
        }
        Ok(())
    }

    /// Requested size, when both axes are given
    pub fn size(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!((config.capture.width, config.capture.height), (512, 512));
        assert_eq!(config.capture.stall_timeout_ms, 2000);
        assert_eq!(config.server.port, 7227);
        assert_eq!(config.scan.max_index, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"server": {"port": 9000}, "capture": {"backends": ["file", "v4l2"], "mode": "letterbox"},
                "endpoints": [{"path": "/cam", "source": "0"}]}"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.jpeg_quality, 80);
        assert_eq!(config.capture.backends, vec![BackendKind::File, BackendKind::V4l2]);
        assert_eq!(config.capture.mode, ResizeMode::Letterbox);
        assert_eq!(config.endpoints[0].source, "0");
        assert_eq!(config.endpoints[0].size(), None);
    }

    #[test]
    fn test_validation() {
        let mut config = AppConfig::default();
        config.capture.fps = Some(0.0);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.server.jpeg_quality = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.endpoints.push(EndpointConfig {
            path: " ".to_string(),
            source: "0".to_string(),
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_mapping() {
        let endpoint = EndpointConfig::parse_mapping("/cam=http://host/video.mjpg").unwrap();
        assert_eq!(endpoint.path, "/cam");
        assert_eq!(endpoint.source, "http://host/video.mjpg");
        assert!(EndpointConfig::parse_mapping("/cam").is_err());
        assert!(EndpointConfig::parse_mapping("=0").is_err());
    }
}
