use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheStats;
use crate::qan::counters::Stat;

const NAMESPACE: &str = "qan";

/// Reads the current statistics of a retaining cache.
pub type CacheStatsFn = Arc<dyn Fn() -> CacheStats + Send + Sync>;

/// Prometheus metrics for agent health and pipeline observability.
///
/// All metrics use the "qan" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Pipeline events by pipeline and event.
    pub pipeline_events: CounterVec,
    /// Reports handed to each exporter.
    pub reports_exported: CounterVec,
    /// Export failures by exporter.
    pub export_errors: CounterVec,
    /// Buckets per exported report.
    pub report_buckets: Histogram,
    /// Retaining cache entries and cumulative operations, by kind.
    pub cache: GaugeVec,
    /// Oldest cache entry age in seconds.
    pub cache_oldest_age: Gauge,
    /// Unix time the agent started.
    pub start_time: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let pipeline_events = CounterVec::new(
            Opts::new(
                "pipeline_events_total",
                "Pipeline events by pipeline and event.",
            )
            .namespace(NAMESPACE),
            &["pipeline", "event"],
        )?;
        let reports_exported = CounterVec::new(
            Opts::new("reports_exported_total", "Reports handed to each exporter.")
                .namespace(NAMESPACE),
            &["exporter"],
        )?;
        let export_errors = CounterVec::new(
            Opts::new("export_errors_total", "Report export failures by exporter.")
                .namespace(NAMESPACE),
            &["exporter"],
        )?;
        let report_buckets = Histogram::with_opts(
            HistogramOpts::new("report_buckets", "Buckets per exported report.")
                .namespace(NAMESPACE)
                .buckets(vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]),
        )?;
        let cache = GaugeVec::new(
            Opts::new(
                "statement_cache",
                "Statement cache size (current) and cumulative added/updated/removed.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;
        let cache_oldest_age = Gauge::with_opts(
            Opts::new(
                "statement_cache_oldest_age_seconds",
                "Age of the oldest statement cache entry.",
            )
            .namespace(NAMESPACE),
        )?;
        let start_time = Gauge::with_opts(
            Opts::new("start_time_seconds", "Unix time the agent started.").namespace(NAMESPACE),
        )?;

        registry.register(Box::new(pipeline_events.clone()))?;
        registry.register(Box::new(reports_exported.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(report_buckets.clone()))?;
        registry.register(Box::new(cache.clone()))?;
        registry.register(Box::new(cache_oldest_age.clone()))?;
        registry.register(Box::new(start_time.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            pipeline_events,
            reports_exported,
            export_errors,
            report_buckets,
            cache,
            cache_oldest_age,
            start_time,
        })
    }

    /// Adds a pipeline counter snapshot.
    pub fn record_pipeline(&self, pipeline: &str, snapshot: &[(Stat, u64)]) {
        for (stat, n) in snapshot {
            self.pipeline_events
                .with_label_values(&[pipeline, stat.as_str()])
                .inc_by(*n as f64);
        }
    }

    /// Publishes retaining cache statistics.
    pub fn record_cache(&self, stats: &CacheStats, now: std::time::SystemTime) {
        self.cache
            .with_label_values(&["current"])
            .set(stats.current as f64);
        self.cache
            .with_label_values(&["added"])
            .set(stats.added as f64);
        self.cache
            .with_label_values(&["updated"])
            .set(stats.updated as f64);
        self.cache
            .with_label_values(&["removed"])
            .set(stats.removed as f64);

        let age = stats
            .oldest
            .and_then(|oldest| now.duration_since(oldest).ok())
            .map_or(0.0, |d| d.as_secs_f64());
        self.cache_oldest_age.set(age);
    }

    /// Starts the HTTP server serving /metrics, /healthz and /debug/cache.
    pub async fn start(&self, cache_stats: Option<CacheStatsFn>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            cache_stats,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/debug/cache", get(cache_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    cache_stats: Option<CacheStatsFn>,
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /debug/cache - Retaining cache statistics.
async fn cache_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match &state.cache_stats {
        Some(stats) => (StatusCode::OK, format!("{}\n", stats())),
        None => (
            StatusCode::NOT_FOUND,
            "statement cache disabled\n".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_record_pipeline() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        metrics.record_pipeline("profiler", &[(Stat::ObservationsAdded, 3)]);
        metrics.record_pipeline("profiler", &[(Stat::ObservationsAdded, 2)]);

        let v = metrics
            .pipeline_events
            .with_label_values(&["profiler", "observations_added"])
            .get();
        assert_eq!(v, 5.0);

        let text = metrics.render().expect("render");
        assert!(text.contains("qan_pipeline_events_total"));
    }

    #[test]
    fn test_record_cache() {
        let metrics = HealthMetrics::new(":0").expect("metrics");
        let now = UNIX_EPOCH + Duration::from_secs(1_000);
        let stats = CacheStats {
            current: 4,
            added: 10,
            updated: 3,
            removed: 6,
            oldest: Some(now - Duration::from_secs(90)),
            newest: Some(now),
        };
        metrics.record_cache(&stats, now);

        assert_eq!(metrics.cache.with_label_values(&["current"]).get(), 4.0);
        assert_eq!(metrics.cache.with_label_values(&["removed"]).get(), 6.0);
        assert_eq!(metrics.cache_oldest_age.get(), 90.0);
    }

    #[tokio::test]
    async fn test_server_start_stop() {
        let metrics = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        let addr = metrics
            .start(Some(Arc::new(CacheStats::default)))
            .await
            .expect("start");
        assert_ne!(addr.port(), 0);
        metrics.stop();
        metrics.stop();
    }
}
