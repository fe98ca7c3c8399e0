use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::aggregator::Aggregator;
use super::observation::Observation;
use crate::qan::Feed;

/// Pumps observations from a collector feed into an [`Aggregator`].
///
/// Add errors are logged and the pump keeps going; a closed feed ends the
/// pump cleanly.
pub struct Parser {
    feed: Feed<Observation>,
    aggregator: Arc<Aggregator>,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Parser {
    pub fn new(feed: Feed<Observation>, aggregator: Arc<Aggregator>) -> Self {
        Self {
            feed,
            aggregator,
            running: None,
        }
    }

    /// Spawns the pump. No-op if it is already running.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(pump(
            self.feed.clone(),
            Arc::clone(&self.aggregator),
            token.clone(),
        ));
        self.running = Some((token, handle));
        info!("parser started");
    }

    /// Stops the pump and waits for it to exit. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        let Some((token, handle)) = self.running.take() else {
            return;
        };

        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "parser task join failed");
        }
        info!("parser stopped");
    }

    /// Waits for the pump to drain a feed whose sender has closed.
    pub async fn join(&mut self) {
        let Some((_token, handle)) = self.running.take() else {
            return;
        };

        if let Err(e) = handle.await {
            warn!(error = %e, "parser task join failed");
        }
        info!("parser drained");
    }
}

async fn pump(feed: Feed<Observation>, aggregator: Arc<Aggregator>, token: CancellationToken) {
    loop {
        // A feed that stays ready must not outrun cancellation.
        if token.is_cancelled() {
            return;
        }

        let obs = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            obs = feed.recv() => obs,
        };

        let Some(obs) = obs else {
            return;
        };

        if let Err(e) = aggregator.add(&obs) {
            warn!(error = %e, ns = %obs.ns, op = %obs.op, "dropping observation");
        }
    }
}
