//! Poll-based query analytics from cumulative statement counters.
//!
//! Each tick diffs a fresh snapshot against the retaining cache, then
//! refreshes the cache with that snapshot. The cache outlives entries the
//! source drops, so a statement evicted and re-added upstream is still
//! diffed against its last known counters.

pub mod delta;
pub mod source;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::RetainingCache;
use crate::clock::{unix_secs, Clock};
use crate::qan::counters::{PipelineStats, Stat};
use crate::qan::{Feed, Report};

use delta::{CounterRow, DeltaBucketBuilder};
use source::SnapshotSource;

/// Cache of the previous poll, keyed by query id.
pub type StatementCache = RetainingCache<String, CounterRow>;

/// Tuning for one poller.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub agent_id: Arc<str>,
    pub interval: Duration,
    pub cache_retain: Duration,
    pub cache_size_limit: usize,
}

impl PollerConfig {
    pub fn new(agent_id: impl Into<Arc<str>>) -> Self {
        Self {
            agent_id: agent_id.into(),
            interval: Duration::from_secs(60),
            cache_retain: Duration::from_secs(30 * 60),
            cache_size_limit: 5000,
        }
    }
}

/// State carried from one poll to the next.
struct PollLoop<S: SnapshotSource> {
    source: Arc<S>,
    builder: DeltaBucketBuilder,
    cache: Arc<StatementCache>,
    clock: Arc<dyn Clock>,
    stats: Arc<PipelineStats>,
    primed: bool,
    last_poll: SystemTime,
}

impl<S: SnapshotSource> PollLoop<S> {
    /// Takes one snapshot. Returns a report when any statement saw activity.
    ///
    /// The first successful snapshot only primes the cache. A failed
    /// snapshot leaves the cache and the window start untouched.
    async fn poll(&mut self) -> Option<Report> {
        let now = self.clock.now();
        let current = match self.source.snapshot().await {
            Ok(current) => current,
            Err(e) => {
                self.stats.record(Stat::PollErrors);
                warn!(error = %e, "statement snapshot failed, skipping poll");
                return None;
            }
        };
        self.stats.record(Stat::Polls);

        if !self.primed {
            let rows = current.len();
            self.cache.refresh(current);
            self.primed = true;
            self.last_poll = now;
            info!(rows, "statement cache primed");
            return None;
        }

        let previous = self.cache.get();
        let elapsed = now.duration_since(self.last_poll).unwrap_or_default();
        let period_length_secs = u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX).max(1);

        let outcome = self.builder.build(
            &current,
            &previous,
            unix_secs(self.last_poll),
            period_length_secs,
        );
        self.cache.refresh(current);

        self.stats.record_n(Stat::CounterResets, outcome.resets);
        let window_start = std::mem::replace(&mut self.last_poll, now);

        debug!(
            buckets = outcome.buckets.len(),
            period_length_secs,
            cache = %self.cache.stats(),
            "statement poll complete"
        );

        if outcome.buckets.is_empty() {
            return None;
        }
        Some(Report {
            window_start,
            window_end: now,
            buckets: outcome.buckets,
        })
    }

    async fn run(mut self, interval: Duration, tx: mpsc::UnboundedSender<Report>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick is covered by priming in `start`.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let report = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                r = self.poll() => r,
            };

            if let Some(report) = report {
                let buckets = report.buckets.len() as u64;
                if tx.send(report).is_err() {
                    debug!("report feed closed, stopping poller");
                    return;
                }
                self.stats.record(Stat::ReportsEmitted);
                self.stats.record_n(Stat::BucketsEmitted, buckets);
            }
        }
    }
}

/// Periodically diffs a [`SnapshotSource`] into reports.
pub struct Poller<S: SnapshotSource> {
    source: Arc<S>,
    cfg: PollerConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<PipelineStats>,
    cache: Arc<StatementCache>,
    running: Option<(CancellationToken, JoinHandle<()>, Feed<Report>)>,
}

impl<S: SnapshotSource> Poller<S> {
    pub fn new(
        source: S,
        cfg: PollerConfig,
        clock: Arc<dyn Clock>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let cache = Arc::new(RetainingCache::with_clock(
            cfg.cache_retain,
            cfg.cache_size_limit,
            Arc::clone(&clock),
        ));
        Self {
            source: Arc::new(source),
            cfg,
            clock,
            stats,
            cache,
            running: None,
        }
    }

    pub fn cache(&self) -> &Arc<StatementCache> {
        &self.cache
    }

    /// Primes the cache and spawns the poll loop.
    ///
    /// Calling it again while running returns the same feed.
    pub async fn start(&mut self) -> Feed<Report> {
        if let Some((_, _, feed)) = &self.running {
            return feed.clone();
        }

        let mut poll_loop = PollLoop {
            source: Arc::clone(&self.source),
            builder: DeltaBucketBuilder::new(Arc::clone(&self.cfg.agent_id)),
            cache: Arc::clone(&self.cache),
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&self.stats),
            primed: false,
            last_poll: self.clock.now(),
        };
        // Never emits: the first successful snapshot only primes.
        let _ = poll_loop.poll().await;

        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Feed::unbounded(rx);
        let token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop.run(self.cfg.interval, tx, token.clone()));
        self.running = Some((token, handle, feed.clone()));

        info!(
            interval = ?self.cfg.interval,
            cache_retain = ?self.cfg.cache_retain,
            cache_size_limit = self.cfg.cache_size_limit,
            "statement poller started"
        );
        feed
    }

    /// Stops the poll loop and waits for it; the feed closes once drained.
    pub async fn stop(&mut self) {
        let Some((token, handle, _)) = self.running.take() else {
            return;
        };

        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "poller task join failed");
        }
        info!("statement poller stopped");
    }
}
