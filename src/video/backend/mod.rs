//! Capture backends
//!
//! A backend knows how to open one family of sources (V4L2 devices, files,
//! HTTP streams) into a [`CaptureStream`]. Source handles hold an ordered
//! preference list of [`BackendKind`]s; [`BackendSet::open`] walks that list
//! and the first backend that opens the source wins.

pub mod file;
pub mod http;
pub mod v4l2;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::format::Resolution;
use super::frame::VideoFrame;
use super::source::SourceId;
use crate::config::CaptureConfig;
use crate::error::{AppError, Result};

pub use file::FileBackend;
pub use http::HttpBackend;
pub use v4l2::V4l2Backend;

/// Capture API hint used in backend preference lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Any registered backend that accepts the source
    #[default]
    Any,
    /// Video4Linux2 capture devices
    V4l2,
    /// Local MJPEG files, image directories and still images
    File,
    /// HTTP(S) MJPEG streams and JPEG snapshot URLs
    Http,
}

impl BackendKind {
    /// Whether a preference entry selects backends of kind `other`
    pub fn matches(&self, other: BackendKind) -> bool {
        *self == BackendKind::Any || *self == other
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Any => "any",
            BackendKind::V4l2 => "v4l2",
            BackendKind::File => "file",
            BackendKind::Http => "http",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "any" | "auto" => Ok(BackendKind::Any),
            "v4l2" | "v4l" => Ok(BackendKind::V4l2),
            "file" => Ok(BackendKind::File),
            "http" | "https" => Ok(BackendKind::Http),
            _ => Err(format!("Unknown capture backend: {}", s)),
        }
    }
}

/// Hints passed to a backend when opening a source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OpenRequest {
    /// Capture target; devices are asked for this size
    pub resolution: Resolution,
    /// Requested frame rate, if any
    pub fps: Option<f64>,
}

/// An open capture resource producing decoded frames
pub trait CaptureStream: Send {
    /// Read and decode the next frame.
    /// Finite sources return [`AppError::EndOfStream`] once exhausted.
    fn read(&mut self) -> Result<VideoFrame>;

    /// Whether the underlying resource is still usable
    fn is_opened(&self) -> bool;

    /// Native frame rate reported by the source
    fn fps(&self) -> Option<f64> {
        None
    }

    /// Total frames of a finite source
    fn frame_count(&self) -> Option<u64> {
        None
    }

    /// Index of the next frame to be read
    fn position(&self) -> u64 {
        0
    }

    /// Move a finite source to `frame`
    fn seek(&mut self, _frame: u64) -> Result<()> {
        Err(AppError::Unsupported("seek on a live source".to_string()))
    }

    /// Close the resource; later reads fail and `is_opened` is false
    fn release(&mut self);
}

/// A capture API able to open some family of sources
pub trait CaptureBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Whether this backend can address `id` at all
    fn supports(&self, id: &SourceId) -> bool;

    fn open(&self, id: &SourceId, request: &OpenRequest) -> Result<Box<dyn CaptureStream>>;
}

/// A stream together with the backend that opened it
pub struct OpenedStream {
    pub backend: BackendKind,
    pub stream: Box<dyn CaptureStream>,
}

/// Ordered collection of capture backends
#[derive(Clone)]
pub struct BackendSet {
    providers: Vec<Arc<dyn CaptureBackend>>,
}

impl BackendSet {
    pub fn new(providers: Vec<Arc<dyn CaptureBackend>>) -> Self {
        Self { providers }
    }

    /// V4L2, file and HTTP backends configured from `config`
    pub fn platform(config: &CaptureConfig) -> Self {
        Self::new(vec![
            Arc::new(V4l2Backend::new(config.v4l2_buffer_count)),
            Arc::new(FileBackend::new(config.file_fps)),
            Arc::new(HttpBackend::new(config.http_connect_timeout())),
        ])
    }

    /// Open `id` trying `preferences` in order; first success wins.
    ///
    /// An empty preference list means `[Any]`. Exhausting the list yields
    /// [`AppError::OpenFailure`] carrying every backend's reason.
    pub fn open(
        &self,
        id: &SourceId,
        preferences: &[BackendKind],
        request: &OpenRequest,
    ) -> Result<OpenedStream> {
        let preferences = if preferences.is_empty() {
            &[BackendKind::Any][..]
        } else {
            preferences
        };

        let mut tried = HashSet::new();
        let mut reasons = Vec::new();

        for preference in preferences {
            for provider in &self.providers {
                let kind = provider.kind();
                if !preference.matches(kind) || !provider.supports(id) || !tried.insert(kind) {
                    continue;
                }
                match provider.open(id, request) {
                    Ok(stream) => {
                        debug!("Opened {} with {} backend", id, kind);
                        return Ok(OpenedStream {
                            backend: kind,
                            stream,
                        });
                    }
                    Err(e) => {
                        debug!("{} backend could not open {}: {}", kind, id, e);
                        reasons.push(format!("{}: {}", kind, e));
                    }
                }
            }
        }

        let reason = if reasons.is_empty() {
            "no backend accepts this source".to_string()
        } else {
            reasons.join("; ")
        };
        Err(AppError::OpenFailure {
            source_id: id.to_string(),
            reason,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory backend for exercising handles, the registry and the server

    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Configurable fake capture API
    pub struct MockBackend {
        kind: BackendKind,
        /// Device indices at or above this fail to open
        pub device_limit: Option<u32>,
        /// Every open fails
        pub fail_open: bool,
        /// Opens after this many successes fail
        pub max_opens: Option<usize>,
        /// Finite sequence length
        pub frame_count: Option<u64>,
        /// Reads before the stream reports itself closed
        pub close_after: Option<u64>,
        pub resolution: Resolution,
        pub fps: Option<f64>,
        pub open_delay: Duration,
        pub attempts: AtomicUsize,
        pub opens: AtomicUsize,
        pub attempted: Mutex<Vec<SourceId>>,
    }

    impl MockBackend {
        pub fn new(kind: BackendKind) -> Self {
            Self {
                kind,
                device_limit: None,
                fail_open: false,
                max_opens: None,
                frame_count: None,
                close_after: None,
                resolution: Resolution::new(32, 24),
                fps: None,
                open_delay: Duration::ZERO,
                attempts: AtomicUsize::new(0),
                opens: AtomicUsize::new(0),
                attempted: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(kind: BackendKind) -> Self {
            Self {
                fail_open: true,
                ..Self::new(kind)
            }
        }

        pub fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }
    }

    impl CaptureBackend for MockBackend {
        fn kind(&self) -> BackendKind {
            self.kind
        }

        fn supports(&self, _id: &SourceId) -> bool {
            true
        }

        fn open(&self, id: &SourceId, _request: &OpenRequest) -> Result<Box<dyn CaptureStream>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.attempted.lock().push(id.clone());
            std::thread::sleep(self.open_delay);

            let over_limit = match (id, self.device_limit) {
                (SourceId::Device(index), Some(limit)) => *index >= limit,
                _ => false,
            };
            let exhausted = self
                .max_opens
                .is_some_and(|max| self.opens.load(Ordering::SeqCst) >= max);
            if self.fail_open || over_limit || exhausted {
                return Err(AppError::VideoError(format!("mock cannot open {}", id)));
            }

            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockStream {
                opened: true,
                position: 0,
                reads: 0,
                frame_count: self.frame_count,
                close_after: self.close_after,
                resolution: self.resolution,
                fps: self.fps,
            }))
        }
    }

    /// Color of frame `index` in a mock sequence
    pub fn mock_color(index: u64) -> [u8; 3] {
        [((index * 40) % 256) as u8, 0, 0]
    }

    pub struct MockStream {
        opened: bool,
        position: u64,
        reads: u64,
        frame_count: Option<u64>,
        close_after: Option<u64>,
        resolution: Resolution,
        fps: Option<f64>,
    }

    impl CaptureStream for MockStream {
        fn read(&mut self) -> Result<VideoFrame> {
            if !self.opened {
                return Err(AppError::ReadFailure("stream closed".to_string()));
            }
            if self.close_after.is_some_and(|limit| self.reads >= limit) {
                self.opened = false;
                return Err(AppError::ReadFailure("device lost".to_string()));
            }
            if self.frame_count.is_some_and(|count| self.position >= count) {
                return Err(AppError::EndOfStream);
            }
            let frame = VideoFrame::solid(self.resolution, mock_color(self.position), 0);
            self.position += 1;
            self.reads += 1;
            Ok(frame)
        }

        fn is_opened(&self) -> bool {
            self.opened
        }

        fn fps(&self) -> Option<f64> {
            self.fps
        }

        fn frame_count(&self) -> Option<u64> {
            self.frame_count
        }

        fn position(&self) -> u64 {
            self.position
        }

        fn seek(&mut self, frame: u64) -> Result<()> {
            self.position = frame;
            Ok(())
        }

        fn release(&mut self) {
            self.opened = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockBackend;
    use super::*;

    fn request() -> OpenRequest {
        OpenRequest {
            resolution: Resolution::DEFAULT,
            fps: None,
        }
    }

    #[test]
    fn test_first_success_wins() {
        let failing = Arc::new(MockBackend::failing(BackendKind::V4l2));
        let working = Arc::new(MockBackend::new(BackendKind::File));
        let set = BackendSet::new(vec![failing.clone(), working.clone()]);

        let opened = set.open(&SourceId::Device(0), &[BackendKind::Any], &request()).unwrap();
        assert_eq!(opened.backend, BackendKind::File);
        assert_eq!(failing.attempts(), 1);
        assert_eq!(working.opens(), 1);
    }

    #[test]
    fn test_preference_order_is_respected() {
        let v4l2 = Arc::new(MockBackend::new(BackendKind::V4l2));
        let file = Arc::new(MockBackend::new(BackendKind::File));
        let set = BackendSet::new(vec![v4l2.clone(), file.clone()]);

        let opened = set
            .open(&SourceId::Device(0), &[BackendKind::File, BackendKind::V4l2], &request())
            .unwrap();
        assert_eq!(opened.backend, BackendKind::File);
        assert_eq!(v4l2.attempts(), 0);
    }

    #[test]
    fn test_exhaustion_is_open_failure() {
        let set = BackendSet::new(vec![Arc::new(MockBackend::failing(BackendKind::V4l2))]);
        let err = set
            .open(&SourceId::Device(7), &[BackendKind::V4l2, BackendKind::Any], &request())
            .err()
            .unwrap();
        match err {
            AppError::OpenFailure { source_id, reason } => {
                assert_eq!(source_id, "device:7");
                assert!(reason.contains("v4l2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unmatched_preference() {
        let set = BackendSet::new(vec![Arc::new(MockBackend::new(BackendKind::V4l2))]);
        let result = set.open(&SourceId::Device(0), &[BackendKind::Http], &request());
        assert!(matches!(result, Err(AppError::OpenFailure { .. })));
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("V4L2".parse::<BackendKind>(), Ok(BackendKind::V4l2));
        assert_eq!("auto".parse::<BackendKind>(), Ok(BackendKind::Any));
        assert!("dshow".parse::<BackendKind>().is_err());
    }
}
