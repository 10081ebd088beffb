//! Time sources for token issuance and retry scheduling

use chrono::{DateTime, Datelike, Utc};
use std::time::Instant;

/// Wall-clock years below this mean the device has not synchronised its clock
pub const SYNC_YEAR_THRESHOLD: i32 = 2019;

/// Wall clock plus a monotonic millisecond counter
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic milliseconds, used only for backoff arithmetic
    fn millis(&self) -> u64;

    /// Current time, or `None` while the clock still reports an implausible year
    fn synced_now(&self) -> Option<DateTime<Utc>> {
        let now = self.now();
        (now.year() >= SYNC_YEAR_THRESHOLD).then_some(now)
    }
}

/// System wall clock with a process-local monotonic counter
#[derive(Debug, Clone)]
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn millis(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
