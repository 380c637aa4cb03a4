//! Monotonic millisecond clock.
//!
//! Inode timestamps decide last-writer-wins merges, so two local mutations
//! must never share a timestamp, even when the wall clock stalls or steps back.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch according to the wall clock.
pub fn wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Strictly increasing timestamp source.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicI64,
}

impl Clock {
    /// Create a clock that has issued nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Next timestamp: the wall clock, or one past the last issued value if
    /// the wall clock has not moved on.
    pub fn now(&self) -> i64 {
        let wall = wall_ms();
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| Some(wall.max(last + 1)))
            .unwrap_or_else(|last| last);
        wall.max(prev + 1)
    }

    /// Account for a timestamp seen elsewhere (loaded or merged) so later
    /// local stamps sort after it.
    pub fn observe(&self, ts: i64) {
        self.last.fetch_max(ts, Ordering::AcqRel);
    }

    /// Last issued or observed timestamp.
    pub fn last(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }
}
