//! Tailing ingestion loop.
//!
//! The collector repeatedly opens a cursor over `(last_collect, now]`,
//! decodes every record into an [`Observation`] and pushes it onto a
//! bounded channel. Every wait in the loop is paired with the cancellation
//! token, so `stop` is never starved by a full channel or a slow source.
//!
//! A cursor that fails mid-read is reopened over the same range; records
//! already delivered from it are skipped rather than sent twice.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::observation::Observation;
use super::source::{ProfileCursor, ProfileSource};
use crate::clock::{unix_secs, Clock};
use crate::qan::counters::{PipelineStats, Stat};
use crate::qan::Feed;

/// Errors returned by [`Collector::start`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectorError {
    #[error("collector has been stopped")]
    Stopped,

    #[error("collector loop exited before becoming ready")]
    Exited,
}

/// Tuning for the tail loop.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Capacity of the observation channel.
    pub channel_capacity: usize,
    /// Fixed delay before retrying a failed cursor.
    pub reconnect_delay: Duration,
    /// Pause after a cursor is exhausted.
    pub tail_interval: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            reconnect_delay: Duration::from_secs(1),
            tail_interval: Duration::from_secs(1),
        }
    }
}

enum State {
    Idle,
    Running {
        token: CancellationToken,
        handle: JoinHandle<()>,
        feed: Feed<Observation>,
    },
    Stopped,
}

/// Tails a [`ProfileSource`] into a bounded observation feed.
pub struct Collector<S: ProfileSource> {
    source: Arc<S>,
    cfg: CollectorConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<PipelineStats>,
    state: State,
}

impl<S: ProfileSource> Collector<S> {
    pub fn new(
        source: S,
        cfg: CollectorConfig,
        clock: Arc<dyn Clock>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            source: Arc::new(source),
            cfg,
            clock,
            stats,
            state: State::Idle,
        }
    }

    /// Spawns the tail loop and waits until the first cursor open either
    /// succeeds, fails, or outlasts `reconnect_delay`.
    ///
    /// Calling it again while running returns the same feed.
    pub async fn start(&mut self) -> Result<Feed<Observation>, CollectorError> {
        match &self.state {
            State::Running { feed, .. } => return Ok(feed.clone()),
            State::Stopped => return Err(CollectorError::Stopped),
            State::Idle => {}
        }

        let (tx, rx) = mpsc::channel(self.cfg.channel_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        let feed = Feed::bounded(rx);
        let token = CancellationToken::new();

        let tail = TailLoop {
            source: Arc::clone(&self.source),
            cfg: self.cfg.clone(),
            clock: Arc::clone(&self.clock),
            stats: Arc::clone(&self.stats),
            tx,
            token: token.clone(),
            ready: Some(ready_tx),
        };
        let handle = tokio::spawn(tail.run());

        self.state = State::Running {
            token,
            handle,
            feed: feed.clone(),
        };

        if ready_rx.await.is_err() {
            return Err(CollectorError::Exited);
        }

        info!(
            channel_capacity = self.cfg.channel_capacity,
            reconnect_delay = ?self.cfg.reconnect_delay,
            "collector started"
        );
        Ok(feed)
    }

    /// Stops the tail loop and waits for it to exit; the feed closes once
    /// drained. Safe to call repeatedly and before `start`.
    pub async fn stop(&mut self) {
        let State::Running { token, handle, .. } = std::mem::replace(&mut self.state, State::Stopped)
        else {
            return;
        };

        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "collector task join failed");
        }
        info!("collector stopped");
    }
}

enum Drain {
    Exhausted,
    Failed(anyhow::Error),
    Cancelled,
}

struct TailLoop<S: ProfileSource> {
    source: Arc<S>,
    cfg: CollectorConfig,
    clock: Arc<dyn Clock>,
    stats: Arc<PipelineStats>,
    tx: mpsc::Sender<Observation>,
    token: CancellationToken,
    ready: Option<oneshot::Sender<()>>,
}

/// Position of the last delivered record, used to skip records a retried
/// cursor replays.
///
/// Cursors yield records in timestamp order, so everything before `ts` and
/// the first `delivered` records at `ts` have already been sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Replay {
    ts: SystemTime,
    delivered: usize,
    seen: usize,
}

impl Replay {
    fn new(ts: SystemTime) -> Self {
        Self {
            ts,
            delivered: 1,
            seen: 1,
        }
    }

    /// Called once per record of a retried cursor, in cursor order.
    fn already_delivered(&mut self, ts: SystemTime) -> bool {
        match ts.cmp(&self.ts) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => {
                self.seen += 1;
                self.seen <= self.delivered
            }
            std::cmp::Ordering::Greater => false,
        }
    }

    fn advance(replay: &mut Option<Replay>, ts: SystemTime) {
        match replay {
            Some(r) if r.ts == ts => r.delivered += 1,
            _ => *replay = Some(Replay::new(ts)),
        }
    }
}

impl<S: ProfileSource> TailLoop<S> {
    async fn run(mut self) {
        let mut last_collect = self.clock.now();
        let mut replay: Option<Replay> = None;

        loop {
            if self.token.is_cancelled() {
                return;
            }

            let until = self.clock.now();
            let opened = tokio::select! {
                biased;
                _ = self.token.cancelled() => return,
                r = self.open(last_collect, until) => r,
            };

            if let Some(ready) = self.ready.take() {
                let _ = ready.send(());
            }

            let mut cursor = match opened {
                Ok(cursor) => cursor,
                Err(e) => {
                    self.stats.record(Stat::SourceErrors);
                    warn!(error = %e, "opening profile cursor failed, retrying");
                    if !self.pause(self.cfg.reconnect_delay).await {
                        return;
                    }
                    continue;
                }
            };

            if let Some(r) = replay.as_mut() {
                r.seen = 0;
            }
            match self.drain(&mut cursor, &mut replay).await {
                Drain::Exhausted => {
                    last_collect = until;
                    replay = None;
                    if !self.pause(self.cfg.tail_interval).await {
                        return;
                    }
                }
                Drain::Failed(e) => {
                    // The range is reopened as is; delivered records are skipped.
                    self.stats.record(Stat::SourceErrors);
                    warn!(
                        error = %e,
                        since = unix_secs(last_collect),
                        "reading profile cursor failed, retrying"
                    );
                    if !self.pause(self.cfg.reconnect_delay).await {
                        return;
                    }
                }
                Drain::Cancelled => return,
            }
        }
    }

    /// Opens a cursor. The first open is bounded by `reconnect_delay` so a
    /// hanging source cannot hold up `Collector::start`.
    async fn open(&self, since: SystemTime, until: SystemTime) -> anyhow::Result<S::Cursor> {
        let open = self.source.open(since, until);
        if self.ready.is_none() {
            return open.await;
        }

        match tokio::time::timeout(self.cfg.reconnect_delay, open).await {
            Ok(opened) => opened,
            Err(_) => Err(anyhow::anyhow!(
                "opening profile cursor timed out after {:?}",
                self.cfg.reconnect_delay
            )),
        }
    }

    async fn drain(&self, cursor: &mut S::Cursor, replay: &mut Option<Replay>) -> Drain {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Drain::Cancelled,
                r = cursor.next_record() => r,
            };

            let record = match next {
                Ok(Some(record)) => record,
                Ok(None) => return Drain::Exhausted,
                Err(e) => return Drain::Failed(e),
            };

            if self.token.is_cancelled() {
                return Drain::Cancelled;
            }

            self.stats.record(Stat::RecordsRead);
            let obs = match Observation::decode(record) {
                Ok(obs) => obs,
                Err(e) => {
                    self.stats.record(Stat::DecodeErrors);
                    warn!(error = %e, "skipping undecodable profile record");
                    continue;
                }
            };

            if obs.is_profiler_namespace() {
                continue;
            }

            let ts = obs.ts;
            if replay.as_mut().is_some_and(|r| r.already_delivered(ts)) {
                continue;
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Drain::Cancelled,
                r = self.tx.send(obs) => {
                    if r.is_err() {
                        debug!("observation feed closed");
                        return Drain::Cancelled;
                    }
                }
            }
            Replay::advance(replay, ts);
        }
    }

    /// Sleeps for `d`; returns false if cancelled first.
    async fn pause(&self, d: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }
}
