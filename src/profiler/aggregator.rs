//! Windowed aggregation of profiler observations.
//!
//! The aggregator owns exactly one open window `[start, end)`. Observations
//! inside it are folded per fingerprint; an observation at or past `end`
//! closes the window and opens the one containing it; an observation before
//! `start` is stale and discarded. An idle timer closes the window after one
//! interval without activity so a silent source still reports. Windows with
//! no observations are never emitted.

use std::mem;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fingerprint::{FingerprintError, Fingerprinter};
use super::observation::Observation;
use crate::clock::{truncate, unix_secs, Clock};
use crate::qan::counters::{PipelineStats, Stat};
use crate::qan::stats::{Sample, StatsAccumulator};
use crate::qan::{Feed, Report};

/// Default window duration.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Errors returned by [`Aggregator`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("aggregator is not running")]
    NotRunning,

    #[error("aggregator has been stopped")]
    Stopped,

    #[error("fingerprinting observation: {0}")]
    Fingerprint(#[from] FingerprintError),
}

/// Tuning for one aggregator instance.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub agent_id: Arc<str>,
    /// Window duration.
    pub interval: Duration,
}

impl AggregatorConfig {
    pub fn new(agent_id: impl Into<Arc<str>>) -> Self {
        Self {
            agent_id: agent_id.into(),
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

struct Window {
    start: SystemTime,
    end: SystemTime,
    queries: StatsAccumulator,
}

impl Window {
    fn open(start: SystemTime, interval: Duration) -> Self {
        Self {
            start,
            end: start + interval,
            queries: StatsAccumulator::new(),
        }
    }
}

struct Running {
    window: Window,
    tx: mpsc::UnboundedSender<Report>,
    feed: Feed<Report>,
}

enum State {
    Idle,
    Running(Running),
    Stopped,
}

struct Inner {
    cfg: AggregatorConfig,
    clock: Arc<dyn Clock>,
    state: parking_lot::Mutex<State>,
    idle_reset: Notify,
    stats: Arc<PipelineStats>,
}

impl Inner {
    fn period_length_secs(&self) -> u32 {
        u32::try_from(self.cfg.interval.as_secs()).unwrap_or(u32::MAX)
    }

    /// Emits `window` as a report unless it is empty.
    fn emit(&self, tx: &mpsc::UnboundedSender<Report>, mut window: Window) {
        if window.queries.is_empty() {
            debug!(
                window_start = unix_secs(window.start),
                "empty window suppressed"
            );
            return;
        }

        let buckets = window.queries.finalize(
            &self.cfg.agent_id,
            unix_secs(window.start),
            self.period_length_secs(),
        );
        let count = buckets.len();

        let report = Report {
            window_start: window.start,
            window_end: window.end,
            buckets,
        };
        if tx.send(report).is_err() {
            warn!(buckets = count, "report feed closed, dropping window");
            return;
        }

        self.stats.record(Stat::ReportsEmitted);
        self.stats.record_n(Stat::BucketsEmitted, count as u64);
        debug!(
            window_start = unix_secs(window.start),
            buckets = count,
            "window flushed"
        );
    }

    /// Closes the open window and opens the next one at or after its end.
    fn flush(&self) {
        let mut state = self.state.lock();
        let State::Running(running) = &mut *state else {
            return;
        };

        // An empty window has no emitted range to stay clear of.
        let now = truncate(self.clock.now(), self.cfg.interval);
        let next_start = if running.window.queries.is_empty() {
            now.max(running.window.start)
        } else {
            now.max(running.window.end)
        };
        let closed = mem::replace(
            &mut running.window,
            Window::open(next_start, self.cfg.interval),
        );
        self.emit(&running.tx, closed);
    }
}

struct IdleTimer {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Groups observations into fixed windows and emits one [`Report`] per
/// closed, non-empty window.
pub struct Aggregator {
    inner: Arc<Inner>,
    fingerprinter: Arc<dyn Fingerprinter>,
    timer: parking_lot::Mutex<Option<IdleTimer>>,
}

impl Aggregator {
    pub fn new(
        cfg: AggregatorConfig,
        fingerprinter: Arc<dyn Fingerprinter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_stats(cfg, fingerprinter, clock, Arc::new(PipelineStats::new()))
    }

    /// Creates an aggregator that records into shared pipeline counters.
    pub fn with_stats(
        cfg: AggregatorConfig,
        fingerprinter: Arc<dyn Fingerprinter>,
        clock: Arc<dyn Clock>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                clock,
                state: parking_lot::Mutex::new(State::Idle),
                idle_reset: Notify::new(),
                stats,
            }),
            fingerprinter,
            timer: parking_lot::Mutex::new(None),
        }
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.inner.stats
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Running(_))
    }

    /// Opens the first window and starts the idle timer.
    ///
    /// Calling it again while running returns the same report feed.
    /// Must be called within a tokio runtime.
    pub fn start(&self) -> Result<Feed<Report>, AggregatorError> {
        let mut state = self.inner.state.lock();
        match &*state {
            State::Running(running) => return Ok(running.feed.clone()),
            State::Stopped => return Err(AggregatorError::Stopped),
            State::Idle => {}
        }

        let interval = self.inner.cfg.interval;
        let start = truncate(self.inner.clock.now(), interval);
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Feed::unbounded(rx);

        *state = State::Running(Running {
            window: Window::open(start, interval),
            tx,
            feed: feed.clone(),
        });

        let token = CancellationToken::new();
        let handle = tokio::spawn(idle_timer(Arc::clone(&self.inner), token.clone()));
        *self.timer.lock() = Some(IdleTimer { token, handle });

        info!(
            interval = ?interval,
            window_start = unix_secs(start),
            "aggregator started"
        );

        Ok(feed)
    }

    /// Folds one observation into the open window.
    pub fn add(&self, obs: &Observation) -> Result<(), AggregatorError> {
        let inner = &*self.inner;
        let mut state = inner.state.lock();
        let State::Running(running) = &mut *state else {
            return Err(AggregatorError::NotRunning);
        };

        if obs.ts < running.window.start {
            inner.stats.record(Stat::StaleSkipped);
            debug!(
                ts = unix_secs(obs.ts),
                window_start = unix_secs(running.window.start),
                ns = %obs.ns,
                "stale observation skipped"
            );
            return Ok(());
        }

        if obs.ts >= running.window.end {
            let next = Window::open(truncate(obs.ts, inner.cfg.interval), inner.cfg.interval);
            let closed = mem::replace(&mut running.window, next);
            inner.emit(&running.tx, closed);
        }

        inner.idle_reset.notify_one();

        let fingerprint = self.fingerprinter.fingerprint(obs).map_err(|e| {
            inner.stats.record(Stat::FingerprintErrors);
            e
        })?;

        let example = obs.example();
        running.window.queries.add(Sample {
            fingerprint: &fingerprint,
            namespace: &obs.ns,
            ts: obs.ts,
            example: example.as_deref(),
            metrics: &obs.metrics(),
        });
        inner.stats.record(Stat::ObservationsAdded);

        Ok(())
    }

    /// Closes the open window now and opens the next one.
    ///
    /// A non-empty window is emitted and the next one starts at the later of
    /// its end and the current truncated time, so windows never overlap.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Flushes the in-flight window, closes the report feed and waits for
    /// the idle timer to exit. Safe to call repeatedly and before `start`.
    pub async fn stop(&self) {
        let timer = {
            let mut state = self.inner.state.lock();
            if let State::Running(running) = mem::replace(&mut *state, State::Stopped) {
                let Running { window, tx, .. } = running;
                self.inner.emit(&tx, window);
                info!("aggregator stopped");
            }
            self.timer.lock().take()
        };

        if let Some(timer) = timer {
            timer.token.cancel();
            if let Err(e) = timer.handle.await {
                warn!(error = %e, "aggregator idle timer join failed");
            }
        }
    }
}

async fn idle_timer(inner: Arc<Inner>, token: CancellationToken) {
    let interval = inner.cfg.interval;
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = inner.idle_reset.notified() => continue,
            _ = tokio::time::sleep(interval) => {
                debug!("idle flush");
                inner.flush();
            }
        }
    }
}
