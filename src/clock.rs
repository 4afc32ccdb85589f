//! Time abstraction for the pipeline.
//!
//! Every "now" read inside the engine goes through [`Clock`] so the same
//! throttling and minimum-hold logic computes against wall time in live mode
//! and against simulated time under replay. Nothing in the pipeline calls
//! `Utc::now()` directly.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

/// Source of the current time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Real wall clock for live trading.
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock advanced explicitly by the replay coordinator (and by tests).
/// Never moves backwards.
pub struct VirtualClock {
    now_ms: AtomicI64,
}

impl VirtualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    /// Advance to `ts_ms` if it is ahead of the current simulated time.
    pub fn advance_to(&self, ts_ms: i64) {
        self.now_ms.fetch_max(ts_ms, Ordering::SeqCst);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
