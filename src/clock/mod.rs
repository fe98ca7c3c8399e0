use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time for window boundaries and cache ages.
pub trait Clock: Send + Sync {
    /// Returns the current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Settable clock used to replay recorded activity and drive tests.
///
/// Cloned handles share the same instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<parking_lot::Mutex<SystemTime>>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(parking_lot::Mutex::new(start)),
        }
    }

    /// Moves the clock to `ts`.
    pub fn set(&self, ts: SystemTime) {
        *self.now.lock() = ts;
    }

    /// Moves the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        let mut now = self.now.lock();
        *now += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// Floors `ts` to a multiple of `d` since the Unix epoch.
///
/// A zero `d` or a pre-epoch `ts` is returned unchanged.
pub fn truncate(ts: SystemTime, d: Duration) -> SystemTime {
    let step = d.as_nanos();
    if step == 0 {
        return ts;
    }

    let Ok(since_epoch) = ts.duration_since(UNIX_EPOCH) else {
        return ts;
    };

    let nanos = since_epoch.as_nanos();
    let floored = nanos - nanos % step;
    UNIX_EPOCH + duration_from_nanos(floored)
}

/// Whole seconds since the Unix epoch, 0 for pre-epoch times.
pub fn unix_secs(ts: SystemTime) -> u64 {
    ts.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

fn duration_from_nanos(nanos: u128) -> Duration {
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    // Remainder is always below one second.
    let subsec = (nanos % 1_000_000_000) as u32;
    Duration::new(secs, subsec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_to_minute() {
        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_059) + Duration::from_millis(999);
        let floored = truncate(ts, Duration::from_secs(60));
        assert_eq!(floored, UNIX_EPOCH + Duration::from_secs(1_700_000_040));
    }

    #[test]
    fn test_truncate_on_boundary_is_identity() {
        let ts = UNIX_EPOCH + Duration::from_secs(1_700_000_040);
        assert_eq!(truncate(ts, Duration::from_secs(60)), ts);
    }

    #[test]
    fn test_truncate_sub_second_interval() {
        let ts = UNIX_EPOCH + Duration::from_millis(1_250);
        assert_eq!(
            truncate(ts, Duration::from_millis(500)),
            UNIX_EPOCH + Duration::from_millis(1_000)
        );
    }

    #[test]
    fn test_truncate_zero_interval() {
        let ts = UNIX_EPOCH + Duration::from_millis(1_250);
        assert_eq!(truncate(ts, Duration::ZERO), ts);
    }

    #[test]
    fn test_unix_secs() {
        let ts = UNIX_EPOCH + Duration::from_millis(42_900);
        assert_eq!(unix_secs(ts), 42);
        assert_eq!(unix_secs(UNIX_EPOCH - Duration::from_secs(5)), 0);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let start = UNIX_EPOCH + Duration::from_secs(100);
        let clock = ManualClock::new(start);
        let other = clock.clone();

        clock.advance(Duration::from_secs(5));
        assert_eq!(other.now(), start + Duration::from_secs(5));

        other.set(start);
        assert_eq!(clock.now(), start);
    }
}
