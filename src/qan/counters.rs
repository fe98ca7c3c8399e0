use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pipeline event counted by [`PipelineStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Stat {
    /// Raw records read from a profile source.
    RecordsRead = 0,
    /// Records that failed to decode into observations.
    DecodeErrors = 1,
    /// Profile cursor opens or reads that failed.
    SourceErrors = 2,
    /// Observations accepted into a window.
    ObservationsAdded = 3,
    /// Observations older than the open window, discarded.
    StaleSkipped = 4,
    /// Observations that could not be fingerprinted.
    FingerprintErrors = 5,
    /// Reports emitted downstream.
    ReportsEmitted = 6,
    /// Buckets emitted downstream.
    BucketsEmitted = 7,
    /// Counter snapshots taken.
    Polls = 8,
    /// Counter snapshots that failed.
    PollErrors = 9,
    /// Cumulative counters that went backwards between polls.
    CounterResets = 10,
}

const MAX_STAT: usize = Stat::CounterResets as usize;

impl Stat {
    pub const ALL: [Stat; MAX_STAT + 1] = [
        Self::RecordsRead,
        Self::DecodeErrors,
        Self::SourceErrors,
        Self::ObservationsAdded,
        Self::StaleSkipped,
        Self::FingerprintErrors,
        Self::ReportsEmitted,
        Self::BucketsEmitted,
        Self::Polls,
        Self::PollErrors,
        Self::CounterResets,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RecordsRead => "records_read",
            Self::DecodeErrors => "decode_errors",
            Self::SourceErrors => "source_errors",
            Self::ObservationsAdded => "observations_added",
            Self::StaleSkipped => "stale_skipped",
            Self::FingerprintErrors => "fingerprint_errors",
            Self::ReportsEmitted => "reports_emitted",
            Self::BucketsEmitted => "buckets_emitted",
            Self::Polls => "polls",
            Self::PollErrors => "poll_errors",
            Self::CounterResets => "counter_resets",
        }
    }

    fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock-free per-[`Stat`] counters shared across pipeline components.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
pub struct PipelineStats {
    counts: [AtomicU64; MAX_STAT + 1],
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for `stat` by one.
    pub fn record(&self, stat: Stat) {
        self.record_n(stat, 1);
    }

    /// Increment the counter for `stat` by n.
    pub fn record_n(&self, stat: Stat, n: u64) {
        if let Some(counter) = self.counts.get(stat as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current value of `stat` without resetting it.
    pub fn get(&self, stat: Stat) -> u64 {
        self.counts
            .get(stat as usize)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(Stat, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(stat) = Stat::from_index(i) {
                    result.push((stat, v));
                }
            }
        }

        result
    }
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for stat in Stat::ALL {
            map.entry(&stat.as_str(), &self.get(stat));
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = PipelineStats::new();
        stats.record(Stat::ObservationsAdded);
        stats.record(Stat::ObservationsAdded);
        stats.record(Stat::StaleSkipped);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(snap.contains(&(Stat::ObservationsAdded, 2)));
        assert!(snap.contains(&(Stat::StaleSkipped, 1)));
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = PipelineStats::new();
        stats.record_n(Stat::CounterResets, 3);

        assert_eq!(stats.snapshot(), vec![(Stat::CounterResets, 3)]);
        assert!(stats.snapshot().is_empty());
        assert_eq!(stats.get(Stat::CounterResets), 0);
    }

    #[test]
    fn test_index_matches_discriminant() {
        for (i, stat) in Stat::ALL.iter().enumerate() {
            assert_eq!(*stat as usize, i, "{stat}");
        }
    }
}
