//! Exchange clock synchronization.
//!
//! Private requests carry a nonce derived from exchange time, so the connector
//! tracks the offset between the local clock and the exchange's clock.
//!
//! # Model
//!
//! ```text
//! estimate = local_now_ms + offset_ms
//! offset_ms = server_ms - local_ms_at_request   (last sample wins)
//! ```
//!
//! The offset is a single `AtomicI64`: one writer (completed server-time calls),
//! many readers, no torn values and no blocking on read.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

/// Source of local wall-clock time in milliseconds since the epoch.
pub trait LocalClock: Send + Sync {
    /// Current local time (ms since epoch).
    fn now_ms(&self) -> i64;
}

/// Local clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Tracks the offset between local and exchange time.
pub struct ClockSynchronizer {
    local: Arc<dyn LocalClock>,
    offset_ms: AtomicI64,
    sampled: AtomicBool,
}

impl ClockSynchronizer {
    /// Create a synchronizer over the system clock.
    pub fn new() -> Self {
        Self::with_local_clock(Arc::new(SystemClock))
    }

    /// Create a synchronizer over a custom local clock.
    pub fn with_local_clock(local: Arc<dyn LocalClock>) -> Self {
        Self {
            local,
            offset_ms: AtomicI64::new(0),
            sampled: AtomicBool::new(false),
        }
    }

    /// Local clock reading, uncorrected.
    pub fn local_time_ms(&self) -> i64 {
        self.local.now_ms()
    }

    /// Best estimate of exchange time in milliseconds.
    ///
    /// Falls back to the local clock (offset 0) until a sample is recorded.
    pub fn current_time_ms(&self) -> i64 {
        self.local.now_ms() + self.offset_ms.load(Ordering::Acquire)
    }

    /// Best estimate of exchange time in whole seconds.
    pub fn current_time_secs(&self) -> i64 {
        self.current_time_ms().div_euclid(1000)
    }

    /// Record a server timestamp observed for a request issued at `local_ms_at_request`.
    ///
    /// The most recent sample replaces the offset outright so that drift is
    /// tracked rather than averaged away.
    pub fn record_sample(&self, server_ms: i64, local_ms_at_request: i64) {
        let offset = server_ms - local_ms_at_request;
        self.offset_ms.store(offset, Ordering::Release);
        self.sampled.store(true, Ordering::Release);
        debug!(offset_ms = offset, "Clock offset updated");
    }

    /// Current offset in milliseconds (0 before any sample).
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Acquire)
    }

    /// Whether at least one sample has been recorded.
    pub fn has_sample(&self) -> bool {
        self.sampled.load(Ordering::Acquire)
    }
}

impl Default for ClockSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ClockSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockSynchronizer")
            .field("offset_ms", &self.offset_ms())
            .field("sampled", &self.has_sample())
            .finish()
    }
}

/// Manually driven clock for tests.
#[cfg(test)]
pub(crate) mod test_clock {
    use super::LocalClock;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Debug, Default)]
    pub struct ManualClock(AtomicI64);

    impl ManualClock {
        pub fn at(ms: i64) -> Self {
            Self(AtomicI64::new(ms))
        }

        pub fn set(&self, ms: i64) {
            self.0.store(ms, Ordering::SeqCst);
        }
    }

    impl LocalClock for ManualClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::test_clock::ManualClock;
    use super::*;

    #[test]
    fn test_no_sample_falls_back_to_local() {
        let local = Arc::new(ManualClock::at(1_000_000));
        let clock = ClockSynchronizer::with_local_clock(local);

        assert!(!clock.has_sample());
        assert_eq!(clock.offset_ms(), 0);
        assert_eq!(clock.current_time_ms(), 1_000_000);
    }

    #[test]
    fn test_sample_applies_offset() {
        let local = Arc::new(ManualClock::at(1_000_000));
        let clock = ClockSynchronizer::with_local_clock(local.clone());

        clock.record_sample(1_002_500, 1_000_000);

        assert!(clock.has_sample());
        assert_eq!(clock.current_time_ms(), 1_002_500);

        local.set(1_010_000);
        assert_eq!(clock.current_time_ms(), 1_012_500);
    }

    #[test]
    fn test_last_sample_wins() {
        let local = Arc::new(ManualClock::at(5_000));
        let clock = ClockSynchronizer::with_local_clock(local);

        clock.record_sample(9_000, 5_000);
        clock.record_sample(4_000, 5_000);

        assert_eq!(clock.offset_ms(), -1_000);
        assert_eq!(clock.current_time_ms(), 4_000);
    }

    #[test]
    fn test_current_time_secs_truncates() {
        let local = Arc::new(ManualClock::at(1_234_567_890_999));
        let clock = ClockSynchronizer::with_local_clock(local);

        assert_eq!(clock.current_time_secs(), 1_234_567_890);
    }
}
