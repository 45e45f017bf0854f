//! Source handle: one capture stream polled by a dedicated worker thread
//!
//! The worker reads frames at the handle's frame rate and publishes the
//! latest one into a single-slot buffer (`ArcSwap`). Readers load the slot
//! without ever blocking on the worker, and always see a complete frame of
//! the current target size.
//!
//! Lifecycle:
//! - `new()` starts the worker paused, with a black frame at the target size
//! - `capture()` opens the source through the backend preference list
//! - `pause()` / `release()` stop reading; `release()` also closes the stream
//! - drop stops the worker with a bounded join

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::backend::{BackendKind, BackendSet, OpenRequest, OpenedStream};
use super::convert::{fit_frame, ResizeMode};
use super::format::Resolution;
use super::frame::{next_sequence, VideoFrame};
use super::source::SourceId;
use crate::config::CaptureConfig;
use crate::error::Result;
use crate::utils::LogThrottler;
use crate::{error_throttled, warn_throttled};

/// Loop cadence when neither the caller nor the source gives a frame rate
pub const DEFAULT_FPS: f64 = 60.0;

/// Anything that can hand out its latest frame
pub trait FrameSource: Send + Sync {
    /// `(ok, frame)`: the latest frame and whether the last read succeeded
    fn frame(&self) -> (bool, VideoFrame);
}

/// Construction parameters of a [`SourceHandle`]
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Target `(width, height)`; each axis clamped to `[0, 8192]`
    pub size: Option<(u32, u32)>,
    /// Requested frame rate; the source's own rate is used when unset
    pub fps: Option<f64>,
    pub mode: ResizeMode,
    /// Backends to try, in order
    pub backends: Vec<BackendKind>,
    /// Wait after a successful open before frames are read
    pub settle: Duration,
    /// Continuous closed time before the worker reopens the stream
    pub stall_timeout: Duration,
    /// Bounded wait for the worker on drop
    pub join_timeout: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            size: None,
            fps: None,
            mode: ResizeMode::Fit,
            backends: vec![BackendKind::Any],
            settle: Duration::from_secs(1),
            stall_timeout: Duration::from_secs(2),
            join_timeout: Duration::from_secs(1),
        }
    }
}

impl SourceOptions {
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            size: Some((config.width, config.height)),
            fps: config.fps,
            mode: config.mode,
            backends: config.backends.clone(),
            settle: Duration::from_millis(config.settle_ms),
            stall_timeout: Duration::from_millis(config.stall_timeout_ms),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
        }
    }
}

/// Counters kept by a handle over its lifetime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    /// Frames successfully read and published
    pub frames_read: u64,
    /// Failed opens, from `capture()` and from reopen attempts
    pub open_failures: u64,
    /// Reopens started by stall detection
    pub reopen_attempts: u64,
}

/// Content of the single-slot frame buffer
struct FrameSlot {
    ok: bool,
    frame: VideoFrame,
}

struct Shared {
    id: SourceId,
    backends: Arc<BackendSet>,
    preferences: Vec<BackendKind>,
    mode: ResizeMode,
    requested_fps: Option<f64>,
    settle: Duration,
    stall_timeout: Duration,

    slot: ArcSwap<FrameSlot>,
    /// Target size; held while publishing so a resize never races a stale frame
    size: RwLock<Resolution>,
    stream: Mutex<Option<OpenedStream>>,
    /// Serializes opening so concurrent captures open one stream
    open_lock: Mutex<()>,

    fps_bits: AtomicU64,
    paused: AtomicBool,
    quit: AtomicBool,
    /// Mirrors `is_opened()` of the held stream after every read
    opened: AtomicBool,

    frames_read: AtomicU64,
    open_failures: AtomicU64,
    reopen_attempts: AtomicU64,
    throttler: LogThrottler,
}

/// Single capture source with its own polling thread
pub struct SourceHandle {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl SourceHandle {
    /// Create a handle and start its worker, paused
    pub fn new(id: SourceId, options: SourceOptions, backends: Arc<BackendSet>) -> Result<Self> {
        let target = Resolution::target(options.size);
        let initial_fps = options
            .fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(DEFAULT_FPS)
            .max(1.0);

        let shared = Arc::new(Shared {
            id: id.clone(),
            backends,
            preferences: options.backends,
            mode: options.mode,
            requested_fps: options.fps.filter(|fps| fps.is_finite() && *fps > 0.0),
            settle: options.settle,
            stall_timeout: options.stall_timeout,
            slot: ArcSwap::from_pointee(FrameSlot {
                ok: false,
                frame: VideoFrame::black(Resolution::new(1, 1), 0),
            }),
            size: RwLock::new(Resolution::new(1, 1)),
            stream: Mutex::new(None),
            open_lock: Mutex::new(()),
            fps_bits: AtomicU64::new(initial_fps.to_bits()),
            paused: AtomicBool::new(true),
            quit: AtomicBool::new(false),
            opened: AtomicBool::new(false),
            frames_read: AtomicU64::new(0),
            open_failures: AtomicU64::new(0),
            reopen_attempts: AtomicU64::new(0),
            throttler: LogThrottler::with_secs(5),
        });
        shared.resize(target);

        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name(format!("capture-{}", id))
            .spawn(move || worker_shared.run())?;

        debug!("Created source handle {} at {}", id, target);
        Ok(Self {
            shared,
            worker: Some(worker),
            join_timeout: options.join_timeout,
        })
    }

    pub fn id(&self) -> &SourceId {
        &self.shared.id
    }

    /// Open the source if needed and start reading.
    ///
    /// Idempotent. Returns whether the handle is open afterwards; an open
    /// failure is logged and leaves the handle closed and paused.
    pub fn capture(&self) -> bool {
        let shared = &self.shared;
        let _guard = shared.open_lock.lock();

        if shared.opened.load(Ordering::SeqCst) {
            shared.paused.store(false, Ordering::SeqCst);
            return true;
        }

        match shared.open_stream() {
            Ok(()) => {
                std::thread::sleep(shared.settle);
                shared.paused.store(false, Ordering::SeqCst);
                true
            }
            Err(e) => {
                shared.open_failures.fetch_add(1, Ordering::SeqCst);
                shared.paused.store(true, Ordering::SeqCst);
                error!("{}", e);
                false
            }
        }
    }

    /// Stop reading; the stream stays open
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::SeqCst) {
            debug!("Paused {}", self.shared.id);
        }
    }

    /// Close the stream. Safe to call on a closed handle.
    pub fn release(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.release_stream();
    }

    /// Latest frame and whether the last read succeeded
    pub fn frame(&self) -> (bool, VideoFrame) {
        let slot = self.shared.slot.load();
        (slot.ok, slot.frame.clone())
    }

    pub fn size(&self) -> Resolution {
        *self.shared.size.read()
    }

    /// Change the target size; the cached frame is resized before this returns
    pub fn set_size(&self, width: u32, height: u32) {
        self.shared.resize(Resolution::clamped(width, height));
    }

    pub fn is_open(&self) -> bool {
        self.shared.opened.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Effective frame rate of the worker loop
    pub fn fps(&self) -> f64 {
        self.shared.fps()
    }

    /// Backend of the currently open stream
    pub fn backend(&self) -> Option<BackendKind> {
        self.shared.stream.lock().as_ref().map(|s| s.backend)
    }

    pub fn stats(&self) -> SourceStats {
        let shared = &self.shared;
        SourceStats {
            frames_read: shared.frames_read.load(Ordering::Relaxed),
            open_failures: shared.open_failures.load(Ordering::Relaxed),
            reopen_attempts: shared.reopen_attempts.load(Ordering::Relaxed),
        }
    }
}

impl FrameSource for SourceHandle {
    fn frame(&self) -> (bool, VideoFrame) {
        SourceHandle::frame(self)
    }
}

impl Drop for SourceHandle {
    fn drop(&mut self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.thread().unpark();

        let deadline = Instant::now() + self.join_timeout;
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        if worker.is_finished() {
            let _ = worker.join();
        } else {
            warn!(
                "Capture worker for {} did not stop within {:?}, detaching",
                self.shared.id, self.join_timeout
            );
        }
        if let Some(mut guard) = self.shared.stream.try_lock_for(self.join_timeout) {
            if let Some(mut opened) = guard.take() {
                opened.stream.release();
            }
        }
        self.shared.opened.store(false, Ordering::SeqCst);
    }
}

impl Shared {
    fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    /// Open through the preference list and install the new stream
    fn open_stream(&self) -> Result<()> {
        let request = OpenRequest {
            resolution: *self.size.read(),
            fps: self.requested_fps,
        };
        let opened = self.backends.open(&self.id, &self.preferences, &request)?;

        let fps = self
            .requested_fps
            .or_else(|| opened.stream.fps().filter(|fps| fps.is_finite() && *fps > 0.0))
            .unwrap_or(DEFAULT_FPS)
            .max(1.0);
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        info!("Opened {} via {} at {:.1} fps", self.id, opened.backend, fps);

        let previous = self.stream.lock().replace(opened);
        if let Some(mut previous) = previous {
            previous.stream.release();
        }
        self.opened.store(true, Ordering::SeqCst);
        self.throttler.clear("open");
        Ok(())
    }

    fn release_stream(&self) {
        let taken = self.stream.lock().take();
        self.opened.store(false, Ordering::SeqCst);
        if let Some(mut opened) = taken {
            opened.stream.release();
            info!("Released {}", self.id);
        }
    }

    /// Set the target and republish the cached frame at that size
    fn resize(&self, target: Resolution) {
        let mut size = self.size.write();
        *size = target;
        let current = self.slot.load_full();
        let sequence = next_sequence();
        let frame = if current.ok {
            fit_frame(&current.frame, target, self.mode).with_sequence(sequence)
        } else {
            VideoFrame::black(target, sequence)
        };
        self.slot.store(Arc::new(FrameSlot {
            ok: current.ok,
            frame,
        }));
    }

    fn publish(&self, frame: VideoFrame) {
        let size = self.size.read();
        let frame = fit_frame(&frame, *size, self.mode).with_sequence(next_sequence());
        self.slot.store(Arc::new(FrameSlot { ok: true, frame }));
        self.frames_read.fetch_add(1, Ordering::Relaxed);
    }

    fn publish_failure(&self) {
        let current = self.slot.load_full();
        if current.ok {
            self.slot.store(Arc::new(FrameSlot {
                ok: false,
                frame: current.frame.clone(),
            }));
        }
    }

    fn run(self: Arc<Self>) {
        debug!("Capture worker for {} started", self.id);
        let mut stall_since: Option<Instant> = None;

        while !self.quit.load(Ordering::SeqCst) {
            let started = Instant::now();
            if self.paused.load(Ordering::SeqCst) {
                stall_since = None;
            } else {
                self.poll(&mut stall_since);
            }

            let budget = Duration::from_secs_f64(1.0 / self.fps());
            let remaining = budget.saturating_sub(started.elapsed());
            if !remaining.is_zero() && !self.quit.load(Ordering::SeqCst) {
                std::thread::park_timeout(remaining);
            }
        }
        debug!("Capture worker for {} stopped", self.id);
    }

    /// One loop iteration of an unpaused handle
    fn poll(&self, stall_since: &mut Option<Instant>) {
        match self.read_frame() {
            Some(Ok(frame)) => {
                *stall_since = None;
                self.throttler.clear("read");
                self.publish(frame);
            }
            Some(Err(e)) => {
                warn_throttled!(self.throttler, "read", "Read from {} failed: {}", self.id, e);
                self.publish_failure();
            }
            None => self.publish_failure(),
        }

        if self.opened.load(Ordering::SeqCst) {
            return;
        }
        let since = *stall_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= self.stall_timeout {
            *stall_since = Some(Instant::now());
            self.reopen();
        }
    }

    /// Read one frame, rewinding finite sources at their end.
    /// `None` when no stream is held.
    fn read_frame(&self) -> Option<Result<VideoFrame>> {
        let mut guard = self.stream.lock();
        let stream = &mut guard.as_mut()?.stream;

        let mut result = stream.read();
        let finished = match &result {
            Ok(_) => false,
            Err(e) => {
                e.is_end_of_stream()
                    || stream
                        .frame_count()
                        .is_some_and(|count| stream.position() >= count)
            }
        };
        if finished {
            result = match stream.seek(0) {
                Ok(()) => {
                    debug!("{} reached its end, looping", self.id);
                    stream.read()
                }
                Err(e) => Err(e),
            };
        }
        self.opened.store(stream.is_opened(), Ordering::SeqCst);
        Some(result)
    }

    fn reopen(&self) {
        // an explicit capture() in progress takes care of opening
        let Some(_guard) = self.open_lock.try_lock() else {
            return;
        };
        if self.paused.load(Ordering::SeqCst) || self.opened.load(Ordering::SeqCst) {
            return;
        }

        self.reopen_attempts.fetch_add(1, Ordering::SeqCst);
        warn!(
            "{} closed for more than {:?}, reopening",
            self.id, self.stall_timeout
        );
        self.release_stream();
        if let Err(e) = self.open_stream() {
            self.open_failures.fetch_add(1, Ordering::SeqCst);
            error_throttled!(self.throttler, "open", "Reopen failed: {}", e);
        }
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("id", &self.shared.id)
            .field("size", &self.size())
            .field("open", &self.is_open())
            .field("paused", &self.is_paused())
            .finish()
    }
}
