//! Bounded device probe
//!
//! Device indices are assumed contiguous from zero: probing stops at the
//! first index that does not open. This is not a bus scan; use
//! [`enumerate_devices`](super::device::enumerate_devices) to list nodes.

use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::handle::SourceHandle;
use super::source::SourceId;
use crate::error::Result;

/// Default number of device indices probed
pub const DEFAULT_MAX_INDEX: u32 = 5;

/// Outcome of a scan
pub struct ScanReport {
    /// Handles to register, in index order
    pub handles: Vec<Arc<SourceHandle>>,
    /// Indices that were opened (probe mode only)
    pub opened: Vec<u32>,
    pub elapsed: Duration,
}

/// Probes device indices `0..max_index`
#[derive(Debug, Clone, Copy)]
pub struct DeviceScanner {
    max_index: u32,
}

impl Default for DeviceScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INDEX)
    }
}

impl DeviceScanner {
    pub fn new(max_index: u32) -> Self {
        Self { max_index }
    }

    pub fn indices(&self) -> Range<u32> {
        0..self.max_index
    }

    /// Build a handle per index with `make`.
    ///
    /// With `probe`, each handle is captured and the scan stops at the first
    /// index that fails to open; that index is left out of the report. Every
    /// handle opened while probing is released before returning.
    pub fn scan<F>(&self, probe: bool, mut make: F) -> Result<ScanReport>
    where
        F: FnMut(SourceId) -> Result<SourceHandle>,
    {
        let started = Instant::now();
        let mut handles = Vec::new();
        let mut opened = Vec::new();

        for index in self.indices() {
            let handle = make(SourceId::Device(index))?;
            if probe {
                if !handle.capture() {
                    debug!("Device {} did not open, stopping scan", index);
                    break;
                }
                opened.push(index);
            }
            handles.push(Arc::new(handle));
        }

        if probe {
            for handle in &handles {
                handle.release();
            }
        }

        let elapsed = started.elapsed();
        info!(
            "Device scan found {} source(s) in {:.1} ms (probe={})",
            handles.len(),
            elapsed.as_secs_f64() * 1000.0,
            probe
        );
        Ok(ScanReport {
            handles,
            opened,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::backend::testing::MockBackend;
    use crate::video::backend::{BackendKind, BackendSet};
    use crate::video::handle::SourceOptions;

    fn scanner_for(backend: Arc<MockBackend>) -> impl FnMut(SourceId) -> Result<SourceHandle> {
        let set = Arc::new(BackendSet::new(vec![backend]));
        move |id| {
            let options = SourceOptions {
                settle: Duration::ZERO,
                ..SourceOptions::default()
            };
            SourceHandle::new(id, options, set.clone())
        }
    }

    #[test]
    fn test_probe_stops_at_first_missing_index() {
        let mut backend = MockBackend::new(BackendKind::V4l2);
        backend.device_limit = Some(2);
        let backend = Arc::new(backend);

        let report = DeviceScanner::default()
            .scan(true, scanner_for(backend.clone()))
            .unwrap();
        assert_eq!(report.opened, vec![0, 1]);
        assert_eq!(report.handles.len(), 2);
        assert_eq!(
            *backend.attempted.lock(),
            vec![SourceId::Device(0), SourceId::Device(1), SourceId::Device(2)]
        );
        assert!(report.handles.iter().all(|h| !h.is_open()));
    }

    #[test]
    fn test_probe_without_cameras_tries_index_zero_only() {
        let backend = Arc::new(MockBackend::failing(BackendKind::V4l2));
        let report = DeviceScanner::default()
            .scan(true, scanner_for(backend.clone()))
            .unwrap();
        assert!(report.handles.is_empty());
        assert_eq!(*backend.attempted.lock(), vec![SourceId::Device(0)]);
    }

    #[test]
    fn test_scan_without_probe_opens_nothing() {
        let backend = Arc::new(MockBackend::new(BackendKind::V4l2));
        let report = DeviceScanner::new(3)
            .scan(false, scanner_for(backend.clone()))
            .unwrap();
        let ids: Vec<_> = report.handles.iter().map(|h| h.id().clone()).collect();
        assert_eq!(ids, vec![SourceId::Device(0), SourceId::Device(1), SourceId::Device(2)]);
        assert!(report.opened.is_empty());
        assert_eq!(backend.attempts(), 0);
    }
}
