//! Streaming endpoints: HTTP path -> frame source plus cached frame
//!
//! The server's refresh task copies each source's latest frame into its
//! endpoint; viewers only ever read the endpoint cache. A frame is JPEG
//! encoded at most once per endpoint, whatever the number of viewers.

use arc_swap::ArcSwap;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::http::normalize_path;
use crate::error::{AppError, Result};
use crate::video::encoder::JpegEncoder;
use crate::video::{FrameSource, VideoFrame};

/// JPEG encoding of one cached frame
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub sequence: u64,
    pub data: Bytes,
}

struct CachedFrame {
    ok: bool,
    frame: VideoFrame,
}

#[derive(Default)]
struct JpegState {
    encoder: Option<JpegEncoder>,
    last: Option<EncodedFrame>,
}

pub struct Endpoint {
    path: String,
    source: Arc<dyn FrameSource>,
    cached: ArcSwap<CachedFrame>,
    jpeg: Mutex<JpegState>,
    quality: u8,
}

impl Endpoint {
    pub fn new(path: &str, source: Arc<dyn FrameSource>, quality: u8) -> Self {
        let (ok, frame) = source.frame();
        Self {
            path: normalize_path(path),
            source,
            cached: ArcSwap::from_pointee(CachedFrame { ok, frame }),
            jpeg: Mutex::new(JpegState::default()),
            quality,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Copy the source's latest frame into the cache
    pub fn refresh(&self) {
        let (ok, frame) = self.source.frame();
        let cached = self.cached.load();
        if cached.ok == ok && cached.frame.sequence == frame.sequence {
            return;
        }
        self.cached.store(Arc::new(CachedFrame { ok, frame }));
    }

    /// Cached frame and its ok flag
    pub fn frame(&self) -> (bool, VideoFrame) {
        let cached = self.cached.load();
        (cached.ok, cached.frame.clone())
    }

    pub fn sequence(&self) -> u64 {
        self.cached.load().frame.sequence
    }

    /// JPEG of the cached frame, encoding it on first request.
    ///
    /// Blocks while encoding; call from a blocking context.
    pub fn jpeg(&self) -> Result<EncodedFrame> {
        let (_, frame) = self.frame();
        let mut state = self.jpeg.lock();
        if let Some(last) = state.last.as_ref() {
            if last.sequence == frame.sequence {
                return Ok(last.clone());
            }
        }

        let encoder = match &mut state.encoder {
            Some(encoder) => encoder,
            slot @ None => {
                let encoder = slot.insert(JpegEncoder::new(self.quality)?);
                debug!("Created JPEG encoder for {} (quality {})", self.path, encoder.quality());
                encoder
            }
        };
        let encoded = EncodedFrame {
            sequence: frame.sequence,
            data: encoder.encode(&frame)?,
        };
        state.last = Some(encoded.clone());
        Ok(encoded)
    }
}

/// Path -> endpoint map; lookups are case-insensitive
pub struct EndpointTable {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    quality: u8,
}

impl EndpointTable {
    pub fn new(quality: u8) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            quality: quality.clamp(1, 100),
        }
    }

    /// Map `path` to `source`, replacing any previous mapping
    pub fn register(&self, path: &str, source: Arc<dyn FrameSource>) -> Result<Arc<Endpoint>> {
        if path.trim().is_empty() {
            return Err(AppError::BadRequest("endpoint path must not be empty".to_string()));
        }
        let endpoint = Arc::new(Endpoint::new(path, source, self.quality));
        let key = endpoint.path().to_string();
        if self
            .endpoints
            .write()
            .insert(key.clone(), endpoint.clone())
            .is_some()
        {
            info!("Replaced MJPEG endpoint {}", key);
        } else {
            info!("Registered MJPEG endpoint {}", key);
        }
        Ok(endpoint)
    }

    pub fn get(&self, path: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(&normalize_path(path)).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.endpoints.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }

    /// Refresh every endpoint cache
    pub fn refresh_all(&self) {
        let endpoints: Vec<_> = self.endpoints.read().values().cloned().collect();
        for endpoint in endpoints {
            endpoint.refresh();
        }
    }
}
