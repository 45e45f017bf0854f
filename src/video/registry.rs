//! Source registry: at most one [`SourceHandle`] per [`SourceId`]
//!
//! Collaborators only need `capture`, `frame` and `pause`. Handles are
//! created lazily on first capture, or all at once by a device scan, which
//! replaces the whole registry.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::backend::{BackendKind, BackendSet};
use super::format::Resolution;
use super::frame::VideoFrame;
use super::handle::{FrameSource, SourceHandle, SourceOptions};
use super::scanner::DeviceScanner;
use super::source::SourceId;
use crate::config::AppConfig;
use crate::error::Result;

/// Per-call overrides for [`SourceRegistry::capture`]
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub size: Option<(u32, u32)>,
    pub fps: Option<f64>,
    /// Single backend to use instead of the default preference list
    pub backend: Option<BackendKind>,
}

impl CaptureRequest {
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = Some((width, height));
        self
    }

    pub fn with_fps(mut self, fps: f64) -> Self {
        self.fps = Some(fps);
        self
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = Some(backend);
        self
    }
}

pub struct SourceRegistry {
    handles: RwLock<HashMap<SourceId, Arc<SourceHandle>>>,
    backends: Arc<BackendSet>,
    defaults: SourceOptions,
    scanner: DeviceScanner,
    /// Frame handed out for unregistered ids
    unregistered: VideoFrame,
}

impl SourceRegistry {
    pub fn new(backends: Arc<BackendSet>, defaults: SourceOptions, scanner: DeviceScanner) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            backends,
            defaults,
            scanner,
            unregistered: VideoFrame::black(Resolution::DEFAULT, 0),
        }
    }

    /// Registry with the platform backends
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Arc::new(BackendSet::platform(&config.capture)),
            SourceOptions::from_config(&config.capture),
            DeviceScanner::new(config.scan.max_index),
        )
    }

    fn options_for(&self, request: &CaptureRequest) -> SourceOptions {
        let mut options = self.defaults.clone();
        if request.size.is_some() {
            options.size = request.size;
        }
        if request.fps.is_some() {
            options.fps = request.fps;
        }
        if let Some(backend) = request.backend {
            options.backends = vec![backend];
        }
        options
    }

    /// Handle for `id`, created on first use, then opened.
    ///
    /// Open failures are logged by the handle; check
    /// [`SourceHandle::is_open`] or the `ok` flag of [`frame`](Self::frame).
    pub fn capture(
        &self,
        id: impl Into<SourceId>,
        request: &CaptureRequest,
    ) -> Result<Arc<SourceHandle>> {
        let id = id.into();
        let (handle, created) = {
            let mut handles = self.handles.write();
            match handles.get(&id) {
                Some(handle) => (handle.clone(), false),
                None => {
                    let handle = Arc::new(SourceHandle::new(
                        id.clone(),
                        self.options_for(request),
                        self.backends.clone(),
                    )?);
                    handles.insert(id.clone(), handle.clone());
                    (handle, true)
                }
            }
        };

        if !created {
            if let Some((width, height)) = request.size {
                if handle.size() != Resolution::clamped(width, height) {
                    handle.set_size(width, height);
                }
            }
        }
        handle.capture();
        Ok(handle)
    }

    /// Pause `id`; unknown ids are ignored
    pub fn pause(&self, id: &SourceId) {
        match self.get(id) {
            Some(handle) => handle.pause(),
            None => debug!("pause: {} is not registered", id),
        }
    }

    /// Release and forget `id`; unknown ids are ignored
    pub fn release(&self, id: &SourceId) {
        let removed = self.handles.write().remove(id);
        if let Some(handle) = removed {
            handle.release();
        }
    }

    /// Cached frame of `id`, or a black default frame when unregistered
    pub fn frame(&self, id: &SourceId) -> (bool, VideoFrame) {
        // no Arc clone: the last handle reference must not drop on a reader
        match self.handles.read().get(id) {
            Some(handle) => handle.frame(),
            None => (false, self.unregistered.clone()),
        }
    }

    pub fn get(&self, id: &SourceId) -> Option<Arc<SourceHandle>> {
        self.handles.read().get(id).cloned()
    }

    /// Handles currently open
    pub fn active(&self) -> Vec<Arc<SourceHandle>> {
        self.handles
            .read()
            .values()
            .filter(|h| h.is_open())
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<SourceId> {
        self.handles.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }

    /// Replace the registry with the devices found by a scan.
    ///
    /// Returns the registered ids in index order.
    pub fn devicescan(&self, probe: bool) -> Result<Vec<SourceId>> {
        self.shutdown();

        let report = self.scanner.scan(probe, |id| {
            SourceHandle::new(id, self.defaults.clone(), self.backends.clone())
        })?;

        let ids: Vec<SourceId> = report.handles.iter().map(|h| h.id().clone()).collect();
        let mut handles = self.handles.write();
        for handle in report.handles {
            handles.insert(handle.id().clone(), handle);
        }
        Ok(ids)
    }

    /// Release and drop every handle
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.handles.write().drain().map(|(_, h)| h).collect();
        if drained.is_empty() {
            return;
        }
        info!("Releasing {} source(s)", drained.len());
        for handle in &drained {
            handle.release();
        }
    }
}

/// Frame source that looks its id up in the registry on every read,
/// so it follows rescans and re-captures
pub struct RegisteredSource {
    registry: Arc<SourceRegistry>,
    id: SourceId,
}

impl RegisteredSource {
    pub fn new(registry: Arc<SourceRegistry>, id: SourceId) -> Self {
        Self { registry, id }
    }
}

impl FrameSource for RegisteredSource {
    fn frame(&self) -> (bool, VideoFrame) {
        self.registry.frame(&self.id)
    }
}
