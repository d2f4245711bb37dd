use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::trace::event::Timestamp;

/// Source of wall-clock time for retention cutoffs and flush-lag margins.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;

    /// Current wall-clock time as a trace timestamp.
    fn now_timestamp(&self) -> Timestamp {
        Timestamp::from_system_time(self.now())
    }
}

/// The operating system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: SystemTime) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(Timestamp::from_system_time(start).as_nanos())),
        }
    }

    /// Create a clock frozen at the given trace timestamp.
    pub fn at(ts: Timestamp) -> Self {
        Self {
            nanos: Arc::new(AtomicU64::new(ts.as_nanos())),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, d: Duration) {
        let step = u64::try_from(d.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_add(step))
            });
    }

    /// Jump to an absolute time.
    pub fn set(&self, ts: Timestamp) {
        self.nanos.store(ts.as_nanos(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        Timestamp(self.nanos.load(Ordering::SeqCst)).to_system_time()
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemClock.now_timestamp() > Timestamp::MIN);
    }

    #[test]
    fn test_manual_clock_advance() {
        let start = UNIX_EPOCH + Duration::from_secs(1_606_824_023);
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(12));
        assert_eq!(clock.now(), start + Duration::from_secs(12));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::at(Timestamp(1_000));
        let other = clock.clone();
        other.set(Timestamp(5_000));
        assert_eq!(clock.now_timestamp(), Timestamp(5_000));
    }
}
