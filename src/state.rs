use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{AppConfig, ConfigStore, EndpointConfig};
use crate::error::{AppError, Result};
use crate::stream::MjpegServer;
use crate::video::{CaptureRequest, RegisteredSource, SourceId, SourceRegistry};

/// Application-wide state: the source registry and the MJPEG server built
/// from one configuration snapshot
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Capture sources by id
    pub registry: Arc<SourceRegistry>,
    /// MJPEG HTTP server
    pub server: Arc<MjpegServer>,
}

impl AppState {
    pub fn new(config: ConfigStore) -> Arc<Self> {
        let registry = Arc::new(SourceRegistry::from_config(&config.get()));
        Self::with_registry(config, registry)
    }

    /// State around an existing registry
    pub fn with_registry(config: ConfigStore, registry: Arc<SourceRegistry>) -> Arc<Self> {
        let server = Arc::new(MjpegServer::new(config.get().server.clone()));
        Arc::new(Self {
            config,
            registry,
            server,
        })
    }

    /// Run the startup scan, open the configured endpoints and start the
    /// server when enabled. Returns the server address.
    pub async fn start(&self) -> Result<Option<SocketAddr>> {
        let config = self.config.get();

        if config.scan.on_startup {
            self.scan(&config).await?;
        }

        for endpoint in &config.endpoints {
            self.open_endpoint(endpoint).await?;
        }

        if !config.server.enabled {
            info!("MJPEG server disabled");
            return Ok(None);
        }
        self.server.start().await.map(Some)
    }

    /// Scan for devices, capture each one found and serve the ones that
    /// open at `/video<N>`, unless a configured endpoint already uses that path
    async fn scan(&self, config: &AppConfig) -> Result<()> {
        let registry = self.registry.clone();
        let probe = config.scan.probe;
        let opened = run_blocking(move || {
            // a probing scan leaves its handles released
            let mut opened = Vec::new();
            for id in registry.devicescan(probe)? {
                if registry.capture(id.clone(), &CaptureRequest::default())?.is_open() {
                    opened.push(id);
                }
            }
            Ok(opened)
        })
        .await?;

        for id in opened {
            let SourceId::Device(index) = id else {
                continue;
            };
            let path = format!("/video{}", index);
            if config
                .endpoints
                .iter()
                .any(|e| e.path.trim().eq_ignore_ascii_case(&path))
            {
                continue;
            }
            self.server
                .register_endpoint(&path, Arc::new(RegisteredSource::new(self.registry.clone(), id)))?;
        }
        Ok(())
    }

    /// Capture the endpoint's source and serve it. A source that fails to
    /// open is still served; its viewers see black frames until a capture
    /// succeeds.
    pub async fn open_endpoint(&self, endpoint: &EndpointConfig) -> Result<()> {
        let id = SourceId::parse(&endpoint.source);
        let mut request = CaptureRequest::default();
        if let Some((width, height)) = endpoint.size() {
            request = request.with_size(width, height);
        }
        if let Some(fps) = endpoint.fps {
            request = request.with_fps(fps);
        }
        if let Some(backend) = endpoint.backend {
            request = request.with_backend(backend);
        }

        let registry = self.registry.clone();
        let capture_id = id.clone();
        let opened =
            run_blocking(move || registry.capture(capture_id, &request).map(|h| h.is_open()))
                .await?;
        if !opened {
            warn!("Endpoint {} starts without a frame from {}", endpoint.path, id);
        }

        self.server.register_endpoint(
            &endpoint.path,
            Arc::new(RegisteredSource::new(self.registry.clone(), id)),
        )
    }

    /// Stop the server, then release every source
    pub async fn shutdown(&self) {
        self.server.stop().await;
        let registry = self.registry.clone();
        if let Err(e) = run_blocking(move || {
            registry.shutdown();
            Ok(())
        })
        .await
        {
            warn!("Source shutdown failed: {}", e);
        }
    }
}

/// Run registry work off the async runtime; handles open and join threads
/// and own blocking HTTP clients.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::VideoError(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::backend::file::tests::write_mjpeg;
    use crate::video::backend::testing::MockBackend;
    use crate::video::{BackendKind, BackendSet, DeviceScanner, SourceOptions};
    use std::path::Path;
    use std::time::{Duration, Instant};

    fn config_with(endpoints: Vec<EndpointConfig>) -> AppConfig {
        let mut config = AppConfig::default();
        config.server.bind = "127.0.0.1".to_string();
        config.server.port = 0;
        config.capture.settle_ms = 0;
        config.endpoints = endpoints;
        config
    }

    fn store(config: AppConfig) -> ConfigStore {
        ConfigStore::with_config(Path::new("unused.json"), config)
    }

    #[tokio::test]
    async fn test_start_serves_configured_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let clip = write_mjpeg(dir.path(), &[[255, 0, 0], [0, 255, 0]]);
        let endpoint = EndpointConfig {
            path: "/Clip".to_string(),
            source: clip.to_string_lossy().to_string(),
            width: Some(64),
            height: Some(48),
            ..EndpointConfig::default()
        };

        let state = AppState::new(store(config_with(vec![endpoint])));
        let addr = state.start().await.unwrap();
        assert!(addr.is_some());
        assert_eq!(state.server.endpoints(), vec!["/clip".to_string()]);

        let handle = state.registry.get(&SourceId::Path(clip)).unwrap();
        assert!(handle.is_open());
        assert_eq!(handle.size().width, 64);
        drop(handle);

        state.shutdown().await;
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unopenable_source_still_registered() {
        let endpoint = EndpointConfig {
            path: "/missing".to_string(),
            source: "/nonexistent/clip.mjpg".to_string(),
            ..EndpointConfig::default()
        };
        let mut config = config_with(vec![endpoint]);
        config.server.enabled = false;

        let state = AppState::new(store(config));
        assert_eq!(state.start().await.unwrap(), None);
        let endpoint = state.server.endpoint("/missing").unwrap();
        endpoint.refresh();
        assert!(!endpoint.frame().0);
        state.shutdown().await;
    }

    fn mock_registry(devices: u32) -> Arc<SourceRegistry> {
        let mut backend = MockBackend::new(BackendKind::V4l2);
        backend.device_limit = Some(devices);
        let options = SourceOptions {
            fps: Some(200.0),
            settle: Duration::ZERO,
            ..SourceOptions::default()
        };
        Arc::new(SourceRegistry::new(
            Arc::new(BackendSet::new(vec![Arc::new(backend)])),
            options,
            DeviceScanner::default(),
        ))
    }

    #[tokio::test]
    async fn test_startup_scan_serves_live_devices() {
        for probe in [true, false] {
            let mut config = config_with(Vec::new());
            config.server.enabled = false;
            config.scan.on_startup = true;
            config.scan.probe = probe;

            let state = AppState::with_registry(store(config), mock_registry(2));
            state.start().await.unwrap();
            assert_eq!(
                state.server.endpoints(),
                vec!["/video0".to_string(), "/video1".to_string()]
            );
            assert_eq!(state.registry.active().len(), 2);

            let endpoint = state.server.endpoint("/video1").unwrap();
            let deadline = Instant::now() + Duration::from_secs(2);
            while !endpoint.frame().0 && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
                endpoint.refresh();
            }
            assert!(endpoint.frame().0);
            state.shutdown().await;
        }
    }
}
