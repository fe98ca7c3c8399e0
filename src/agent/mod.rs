use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::{unix_secs, Clock, SystemClock};
use crate::config::Config;
use crate::export::health::{CacheStatsFn, HealthMetrics};
use crate::export::http::HttpExporter;
use crate::export::{Exporter, LogExporter};
use crate::profiler::fingerprint::ProfileFingerprinter;
use crate::profiler::source::JsonLinesSource;
use crate::profiler::Profiler;
use crate::qan::counters::PipelineStats;
use crate::qan::{Feed, Report};
use crate::statements::source::JsonFileSnapshotSource;
use crate::statements::{Poller, StatementCache};

const PROFILER: &str = "profiler";
const STATEMENTS: &str = "statements";

/// How often pipeline counters are folded into Prometheus.
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Agent orchestrates all components: pipelines, exporters, health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    clock: Arc<dyn Clock>,
    profiler: Option<Profiler<JsonLinesSource>>,
    poller: Option<Poller<JsonFileSnapshotSource>>,
    profiler_stats: Arc<PipelineStats>,
    statements_stats: Arc<PipelineStats>,
    exporters: Option<Arc<Vec<Exporter>>>,
    forwarders: Vec<JoinHandle<()>>,
    reporter: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, building the enabled pipelines.
    pub fn new(cfg: Config) -> Result<Self> {
        Self::with_clock(cfg, Arc::new(SystemClock))
    }

    /// Creates a new Agent reading wall time from `clock`.
    pub fn with_clock(cfg: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        let profiler_stats = Arc::new(PipelineStats::new());
        let statements_stats = Arc::new(PipelineStats::new());

        let profiler = cfg.profiler.enabled.then(|| {
            Profiler::new(
                JsonLinesSource::new(cfg.profiler.path.clone()),
                cfg.profiler.aggregator(&cfg.agent_id),
                cfg.profiler.collector(),
                Arc::new(ProfileFingerprinter),
                Arc::clone(&clock),
                Arc::clone(&profiler_stats),
            )
        });

        let poller = cfg.statements.enabled.then(|| {
            Poller::new(
                JsonFileSnapshotSource::new(cfg.statements.path.clone()),
                cfg.statements.poller(&cfg.agent_id),
                Arc::clone(&clock),
                Arc::clone(&statements_stats),
            )
        });

        Ok(Self {
            cfg,
            health,
            clock,
            profiler,
            poller,
            profiler_stats,
            statements_stats,
            exporters: None,
            forwarders: Vec::new(),
            reporter: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the health metrics registry.
    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start all components and begin collection.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Health server first so probes respond during startup.
        let cache_stats = self.statement_cache().map(|cache| {
            let f: CacheStatsFn = Arc::new(move || cache.stats());
            f
        });
        self.health
            .start(cache_stats)
            .await
            .context("starting health metrics server")?;
        self.health.start_time.set(unix_secs(self.clock.now()) as f64);

        // 1. Exporters.
        let mut exporters = vec![Exporter::Log(LogExporter)];
        if self.cfg.export.http.enabled {
            exporters.push(Exporter::Http(HttpExporter::new(
                self.cfg.export.http.clone(),
            )));
        }
        for exporter in &mut exporters {
            exporter
                .start()
                .await
                .with_context(|| format!("starting {} exporter", exporter.name()))?;
        }
        let exporters = Arc::new(exporters);
        self.exporters = Some(Arc::clone(&exporters));

        // 2. Pipelines, each feeding its own forwarder.
        if let Some(profiler) = self.profiler.as_mut() {
            let feed = profiler.start().await.context("starting profiler")?;
            self.forwarders.push(tokio::spawn(forward(
                PROFILER,
                feed,
                Arc::clone(&exporters),
                Arc::clone(&self.health),
            )));
        }

        if let Some(poller) = self.poller.as_mut() {
            let feed = poller.start().await;
            self.forwarders.push(tokio::spawn(forward(
                STATEMENTS,
                feed,
                Arc::clone(&exporters),
                Arc::clone(&self.health),
            )));
        }

        // 3. Background stats reporter.
        self.spawn_stats_reporter();

        info!(
            agent_id = %self.cfg.agent_id,
            profiler = self.cfg.profiler.enabled,
            statements = self.cfg.statements.enabled,
            exporters = exporters.len(),
            "agent fully started"
        );

        Ok(())
    }

    /// Gracefully stop all components.
    ///
    /// Pipelines flush their in-flight windows before the forwarders drain,
    /// so the last partial window still reaches the exporters.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(profiler) = self.profiler.as_mut() {
            profiler.stop().await;
        }
        if let Some(poller) = self.poller.as_mut() {
            poller.stop().await;
        }

        for handle in self.forwarders.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "report forwarder join failed");
            }
        }

        self.cancel.cancel();
        if let Some(handle) = self.reporter.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "stats reporter join failed");
            }
        }
        self.report_stats();

        if let Some(exporters) = self.exporters.take() {
            match Arc::try_unwrap(exporters) {
                Ok(mut exporters) => {
                    for exporter in &mut exporters {
                        if let Err(e) = exporter.stop().await {
                            error!(exporter = exporter.name(), error = %e, "error stopping exporter");
                        }
                    }
                }
                Err(_) => warn!("exporters still shared at shutdown, skipping stop"),
            }
        }

        self.health.stop();

        info!("agent stopped");
        Ok(())
    }

    fn statement_cache(&self) -> Option<Arc<StatementCache>> {
        self.poller.as_ref().map(|p| Arc::clone(p.cache()))
    }

    /// Folds pipeline counters and cache statistics into Prometheus.
    fn report_stats(&self) {
        fold_stats(
            &self.health,
            &self.profiler_stats,
            &self.statements_stats,
            self.statement_cache().as_deref(),
            self.clock.as_ref(),
        );
    }

    fn spawn_stats_reporter(&mut self) {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let profiler_stats = Arc::clone(&self.profiler_stats);
        let statements_stats = Arc::clone(&self.statements_stats);
        let cache = self.statement_cache();
        let clock = Arc::clone(&self.clock);

        self.reporter = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        fold_stats(
                            &health,
                            &profiler_stats,
                            &statements_stats,
                            cache.as_deref(),
                            clock.as_ref(),
                        );
                    }
                }
            }
        }));
    }
}

fn fold_stats(
    health: &HealthMetrics,
    profiler_stats: &PipelineStats,
    statements_stats: &PipelineStats,
    cache: Option<&StatementCache>,
    clock: &dyn Clock,
) {
    let profiler = profiler_stats.snapshot();
    let statements = statements_stats.snapshot();

    if !profiler.is_empty() || !statements.is_empty() {
        debug!(?profiler, ?statements, "pipeline stats");
    }

    health.record_pipeline(PROFILER, &profiler);
    health.record_pipeline(STATEMENTS, &statements);

    if let Some(cache) = cache {
        health.record_cache(&cache.stats(), clock.now());
    }
}

/// Hands every report from `feed` to each exporter until the feed closes.
async fn forward(
    pipeline: &'static str,
    feed: Feed<Report>,
    exporters: Arc<Vec<Exporter>>,
    health: Arc<HealthMetrics>,
) {
    while let Some(report) = feed.recv().await {
        health.report_buckets.observe(report.buckets.len() as f64);

        for exporter in exporters.iter() {
            match exporter.export(&report).await {
                Ok(()) => health
                    .reports_exported
                    .with_label_values(&[exporter.name()])
                    .inc(),
                Err(e) => {
                    health
                        .export_errors
                        .with_label_values(&[exporter.name()])
                        .inc();
                    warn!(
                        pipeline,
                        exporter = exporter.name(),
                        error = %e,
                        "report export failed"
                    );
                }
            }
        }
    }

    debug!(pipeline, "report feed closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::StatementsConfig;
    use std::time::UNIX_EPOCH;

    #[tokio::test]
    async fn test_agent_start_stop_with_statements() {
        let path = std::env::temp_dir().join(format!(
            "qan-agent-statements-{}.json",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"[{"query_id": "q1", "fingerprint": "SELECT ?", "calls": 1}]"#,
        )
        .expect("write dump");

        let cfg = Config {
            agent_id: "agent-test".to_string(),
            health: crate::config::HealthConfig {
                addr: "127.0.0.1:0".to_string(),
            },
            statements: StatementsConfig {
                enabled: true,
                path: path.clone(),
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.validate().expect("valid");

        let clock = ManualClock::new(UNIX_EPOCH + Duration::from_secs(1_000));
        let mut agent = Agent::with_clock(cfg, Arc::new(clock)).expect("agent");
        agent.start().await.expect("start");
        agent.stop().await.expect("stop");

        let text = agent.health().render().expect("render");
        assert!(text.contains("qan_pipeline_events_total"));
        assert!(text.contains(r#"pipeline="statements""#));

        let _ = std::fs::remove_file(path);
    }
}
