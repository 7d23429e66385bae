//! Advisory user-presence signal
//!
//! Only background refresh of the latest slot looks at this; foreground
//! queries are never gated by it.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the last observed user presence
pub trait ActivitySignal: Send + Sync {
    /// Most recent presence timestamp, if any was ever observed
    fn last_seen(&self) -> Option<DateTime<Utc>>;
}

/// Lock-free recorder of heartbeat timestamps
#[derive(Debug)]
pub struct ActivityTracker {
    /// Milliseconds since the epoch, `i64::MIN` when never seen
    last_seen_ms: AtomicI64,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self {
            last_seen_ms: AtomicI64::new(i64::MIN),
        }
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records presence at `at`; older timestamps never move the signal back
    pub fn record(&self, at: DateTime<Utc>) {
        self.last_seen_ms
            .fetch_max(at.timestamp_millis(), Ordering::AcqRel);
    }
}

impl ActivitySignal for ActivityTracker {
    fn last_seen(&self) -> Option<DateTime<Utc>> {
        match self.last_seen_ms.load(Ordering::Acquire) {
            i64::MIN => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

/// Whether presence was seen within `window` before `now`
pub fn is_active(last_seen: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    last_seen.is_some_and(|seen| now - seen <= window)
}
