//! Rate-limited failure logging
//!
//! During a backend outage every queued file fails on every attempt. This
//! logger emits at most one line per interval and reports how many failures
//! were folded into it.
//!
//! ```ignore
//! let logger = RateLimitedLogger::new(Duration::from_secs(10));
//! logger.failure("upload failed", &path, &err);
//! ```

use std::fmt::Display;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default interval between failure log lines
pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Logs failures at most once per interval
pub struct RateLimitedLogger {
    min_interval: Duration,
    last_logged: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
    total: AtomicU64,
}

impl RateLimitedLogger {
    /// Create a logger with the given minimum interval
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_logged: Mutex::new(None),
            suppressed: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Record a failure for `path`, logging it unless one was logged recently
    ///
    /// Returns true if a log line was emitted.
    pub fn failure(&self, message: &str, path: &Path, error: &dyn Display) -> bool {
        let total = self.total.fetch_add(1, Ordering::Relaxed) + 1;

        if !self.should_log(Instant::now()) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let suppressed = self.suppressed.swap(0, Ordering::Relaxed);
        if suppressed > 0 {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                suppressed,
                total_failures = total,
                "{message} (rate-limited)"
            );
        } else {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                total_failures = total,
                "{message}"
            );
        }
        true
    }

    /// Total failures recorded, logged or not
    pub fn total_failures(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Failures folded since the last emitted line
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    fn should_log(&self, now: Instant) -> bool {
        let mut last = self.last_logged.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl Default for RateLimitedLogger {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_INTERVAL)
    }
}
