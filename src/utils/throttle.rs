//! Log throttling utility
//!
//! Limits how often the same log message is recorded so a lost camera or a
//! flapping stream does not flood the log.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Log throttler that limits how often the same message is logged
///
/// ```rust
/// use framecast::utils::LogThrottler;
///
/// let throttler = LogThrottler::with_secs(5);
/// assert_eq!(throttler.check("open_failed"), Some(0));
/// assert_eq!(throttler.check("open_failed"), None);
/// ```
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Whether a message for `key` may be logged now.
    ///
    /// Returns the number of messages suppressed since the last one that was
    /// let through, or `None` while the key is throttled.
    pub fn check(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed = state.suppressed.saturating_add(1);
                None
            }
            Some(state) => {
                state.last_logged = now;
                Some(std::mem::take(&mut state.suppressed))
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget `key`, so the next error after a recovery is logged immediately
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`, appending the suppressed count when non-zero
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                let message = format!($($arg)*);
                tracing::warn!("{} (suppressed {} repeats)", message, suppressed);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled `tracing::error!`, appending the suppressed count when non-zero
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                let message = format!($($arg)*);
                tracing::error!("{} (suppressed {} repeats)", message, suppressed);
            } else {
                tracing::error!($($arg)*);
            }
        }
    };
}
