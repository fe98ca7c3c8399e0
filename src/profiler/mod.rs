//! Streaming query analytics from a tailed profiler log.
//!
//! `Collector -> Feed<Observation> -> Parser -> Aggregator -> Feed<Report>`

pub mod aggregator;
pub mod collector;
pub mod fingerprint;
pub mod observation;
pub mod parser;
pub mod source;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::clock::Clock;
use crate::qan::counters::PipelineStats;
use crate::qan::{Feed, Report};

use aggregator::{Aggregator, AggregatorConfig};
use collector::{Collector, CollectorConfig};
use fingerprint::Fingerprinter;
use parser::Parser;
use source::ProfileSource;

/// One collector, parser and aggregator wired together.
pub struct Profiler<S: ProfileSource> {
    aggregator: Arc<Aggregator>,
    collector: Collector<S>,
    parser: Option<Parser>,
}

impl<S: ProfileSource> Profiler<S> {
    pub fn new(
        source: S,
        aggregator_cfg: AggregatorConfig,
        collector_cfg: CollectorConfig,
        fingerprinter: Arc<dyn Fingerprinter>,
        clock: Arc<dyn Clock>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        let aggregator = Arc::new(Aggregator::with_stats(
            aggregator_cfg,
            fingerprinter,
            Arc::clone(&clock),
            Arc::clone(&stats),
        ));
        let collector = Collector::new(source, collector_cfg, clock, stats);

        Self {
            aggregator,
            collector,
            parser: None,
        }
    }

    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Starts the aggregator, then the collector, then the parser.
    pub async fn start(&mut self) -> Result<Feed<Report>> {
        let reports = self.aggregator.start().context("starting aggregator")?;
        let observations = self
            .collector
            .start()
            .await
            .context("starting collector")?;

        let parser = self
            .parser
            .get_or_insert_with(|| Parser::new(observations, Arc::clone(&self.aggregator)));
        parser.start();

        info!("profiler started");
        Ok(reports)
    }

    /// Stops the collector, lets the parser drain what was already
    /// collected, then flushes the open window.
    pub async fn stop(&mut self) {
        self.collector.stop().await;
        if let Some(parser) = self.parser.as_mut() {
            parser.join().await;
        }
        self.aggregator.stop().await;
        info!("profiler stopped");
    }
}
