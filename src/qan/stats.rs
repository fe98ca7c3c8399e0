use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::SystemTime;

use sha2::{Digest, Sha256};

use super::{split_namespace, Metric, MetricValues, MetricsBucket};
use crate::clock::unix_secs;

/// Running statistics for one metric of one fingerprint.
///
/// Values are kept for the lifetime of a window so p99 can be read exactly.
#[derive(Debug, Clone, Default)]
pub struct MetricStats {
    sum: f64,
    min: f64,
    max: f64,
    values: Vec<f64>,
}

impl MetricStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one value.
    pub fn add(&mut self, value: f64) {
        if self.values.is_empty() {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.sum += value;
        self.values.push(value);
    }

    pub fn count(&self) -> u64 {
        self.values.len() as u64
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Nearest-rank 99th percentile of the recorded values, 0 when empty.
    pub fn p99(&self) -> f64 {
        percentile(&self.values, 0.99)
    }

    /// Finalized values; `None` when the sum is zero.
    pub fn finalize(&self) -> Option<MetricValues> {
        if self.sum == 0.0 {
            return None;
        }
        Some(MetricValues {
            sum: self.sum,
            count: self.count(),
            min: self.min,
            max: self.max,
            p99: self.p99(),
        })
    }
}

fn percentile(values: &[f64], q: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (q * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len() - 1);
    sorted[idx]
}

/// Per-fingerprint accumulator living inside one window.
#[derive(Debug, Clone)]
pub struct QueryStats {
    pub fingerprint: String,
    pub query_id: String,
    pub database: String,
    pub schema: String,
    pub num_queries: u64,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    example: Option<String>,
    example_time: f64,
    metrics: BTreeMap<Metric, MetricStats>,
}

impl QueryStats {
    fn new(fingerprint: String, namespace: &str, ts: SystemTime) -> Self {
        let (database, schema) = split_namespace(namespace);
        Self {
            query_id: query_id(&fingerprint),
            fingerprint,
            database: database.to_string(),
            schema: schema.to_string(),
            num_queries: 0,
            first_seen: ts,
            last_seen: ts,
            example: None,
            example_time: f64::NEG_INFINITY,
            metrics: BTreeMap::new(),
        }
    }

    pub fn metric(&self, metric: Metric) -> Option<&MetricStats> {
        self.metrics.get(&metric)
    }

    pub fn example(&self) -> Option<&str> {
        self.example.as_deref()
    }

    fn to_bucket(
        &self,
        agent_id: &Arc<str>,
        period_start_unix_secs: u64,
        period_length_secs: u32,
    ) -> MetricsBucket {
        let metrics = self
            .metrics
            .iter()
            .filter_map(|(metric, stats)| stats.finalize().map(|v| (*metric, v)))
            .collect();

        MetricsBucket {
            agent_id: Arc::clone(agent_id),
            query_id: self.query_id.clone(),
            fingerprint: self.fingerprint.clone(),
            database: self.database.clone(),
            schema: self.schema.clone(),
            period_start_unix_secs,
            period_length_secs,
            num_queries: self.num_queries,
            example: self.example.clone(),
            first_seen_unix_secs: Some(unix_secs(self.first_seen)),
            last_seen_unix_secs: Some(unix_secs(self.last_seen)),
            metrics,
        }
    }
}

/// One observation, already fingerprinted, ready to be folded.
#[derive(Debug, Clone, Copy)]
pub struct Sample<'a> {
    pub fingerprint: &'a str,
    pub namespace: &'a str,
    pub ts: SystemTime,
    pub example: Option<&'a str>,
    pub metrics: &'a [(Metric, f64)],
}

/// Groups samples by fingerprint for the currently open window.
#[derive(Debug, Default)]
pub struct StatsAccumulator {
    queries: HashMap<String, QueryStats>,
}

impl StatsAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one sample into its fingerprint's stats.
    ///
    /// The example text follows the slowest sample by `query_time`.
    pub fn add(&mut self, sample: Sample<'_>) {
        let stats = self
            .queries
            .entry(sample.fingerprint.to_string())
            .or_insert_with(|| {
                QueryStats::new(sample.fingerprint.to_string(), sample.namespace, sample.ts)
            });

        stats.num_queries += 1;
        stats.first_seen = stats.first_seen.min(sample.ts);
        stats.last_seen = stats.last_seen.max(sample.ts);

        let mut query_time = 0.0;
        for &(metric, value) in sample.metrics {
            if metric == Metric::QueryTime {
                query_time = value;
            }
            stats.metrics.entry(metric).or_default().add(value);
        }

        if let Some(example) = sample.example {
            if stats.example.is_none() || query_time > stats.example_time {
                stats.example = Some(example.to_string());
                stats.example_time = query_time;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn get(&self, fingerprint: &str) -> Option<&QueryStats> {
        self.queries.get(fingerprint)
    }

    /// Drains the accumulator into one bucket per fingerprint, sorted by
    /// fingerprint. The window metadata is attached uniformly.
    pub fn finalize(
        &mut self,
        agent_id: &Arc<str>,
        period_start_unix_secs: u64,
        period_length_secs: u32,
    ) -> Vec<MetricsBucket> {
        let mut buckets: Vec<MetricsBucket> = self
            .queries
            .drain()
            .map(|(_, stats)| stats.to_bucket(agent_id, period_start_unix_secs, period_length_secs))
            .collect();
        buckets.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        buckets
    }
}

/// Short stable identifier for a fingerprint: the first 16 hex characters
/// of its SHA-256 digest.
pub fn query_id(fingerprint: &str) -> String {
    let digest = Sha256::digest(fingerprint.as_bytes());

    let mut id = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        let _ = write!(id, "{byte:02x}");
    }
    id
}
