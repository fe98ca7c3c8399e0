//! Per-interval deltas of cumulative statement counters.
//!
//! A counter that went backwards means the source reset or truncated its
//! statistics; the current value is then the whole interval's activity.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::qan::{Metric, MetricValues, MetricsBucket};

/// Cumulative counters for one statement digest at one poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterRow {
    pub query_id: String,
    pub fingerprint: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub schema: String,
    pub calls: u64,
    #[serde(default)]
    pub counters: BTreeMap<Metric, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
}

/// One poll's counters keyed by query id.
pub type Snapshot = HashMap<String, CounterRow>;

/// Delta of a cumulative counter, `None` on regression.
fn du64(curr: u64, prev: u64) -> Option<u64> {
    (curr >= prev).then_some(curr - prev)
}

fn df64(curr: f64, prev: f64) -> Option<f64> {
    (curr >= prev).then_some(curr - prev)
}

/// Buckets built from one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeltaOutcome {
    pub buckets: Vec<MetricsBucket>,
    /// Keys whose counters went backwards since the previous poll.
    pub resets: u64,
}

/// Diffs a fresh snapshot against the previous one.
#[derive(Debug, Clone)]
pub struct DeltaBucketBuilder {
    agent_id: Arc<str>,
}

impl DeltaBucketBuilder {
    pub fn new(agent_id: impl Into<Arc<str>>) -> Self {
        Self {
            agent_id: agent_id.into(),
        }
    }

    /// Builds one bucket per key with activity since `previous`.
    ///
    /// Keys without new calls are suppressed. Buckets are ordered by query id.
    pub fn build(
        &self,
        current: &Snapshot,
        previous: &Snapshot,
        period_start_unix_secs: u64,
        period_length_secs: u32,
    ) -> DeltaOutcome {
        let mut outcome = DeltaOutcome::default();

        for (key, row) in current {
            let prev = previous.get(key);

            let (calls, reset) = match prev.map(|p| du64(row.calls, p.calls)) {
                None => (row.calls, false),
                Some(Some(d)) => (d, false),
                Some(None) => (row.calls, true),
            };
            // After a reset every counter restarts, so diff against nothing.
            let prev = if reset { None } else { prev };

            let mut metrics = BTreeMap::new();
            let mut field_reset = false;
            for (&metric, &value) in &row.counters {
                let before = prev
                    .and_then(|p| p.counters.get(&metric).copied())
                    .unwrap_or(0.0);
                let delta = df64(value, before).unwrap_or_else(|| {
                    field_reset = true;
                    value
                });
                if delta > 0.0 {
                    metrics.insert(
                        metric,
                        MetricValues {
                            sum: delta,
                            count: calls,
                            ..Default::default()
                        },
                    );
                }
            }

            if reset || field_reset {
                outcome.resets += 1;
                debug!(
                    query_id = %key,
                    calls = row.calls,
                    previous_calls = previous.get(key).map_or(0, |p| p.calls),
                    "counter reset detected"
                );
            }

            if calls == 0 {
                continue;
            }

            outcome.buckets.push(MetricsBucket {
                agent_id: Arc::clone(&self.agent_id),
                query_id: row.query_id.clone(),
                fingerprint: row.fingerprint.clone(),
                database: row.database.clone(),
                schema: row.schema.clone(),
                period_start_unix_secs,
                period_length_secs,
                num_queries: calls,
                example: row.example.clone(),
                first_seen_unix_secs: None,
                last_seen_unix_secs: None,
                metrics,
            });
        }

        if outcome.resets > 0 {
            info!(resets = outcome.resets, "statement counters reset since last poll");
        }

        outcome.buckets.sort_by(|a, b| a.query_id.cmp(&b.query_id));
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, calls: u64, counters: &[(Metric, f64)]) -> CounterRow {
        CounterRow {
            query_id: id.to_string(),
            fingerprint: format!("SELECT * FROM {id}"),
            database: "app".to_string(),
            schema: "public".to_string(),
            calls,
            counters: counters.iter().copied().collect(),
            example: None,
        }
    }

    fn snapshot(rows: impl IntoIterator<Item = CounterRow>) -> Snapshot {
        rows.into_iter().map(|r| (r.query_id.clone(), r)).collect()
    }

    fn builder() -> DeltaBucketBuilder {
        DeltaBucketBuilder::new("agent-1")
    }

    #[test]
    fn test_normal_delta() {
        let prev = snapshot([row("a", 10, &[(Metric::QueryTime, 100.0), (Metric::RowsSent, 5.0)])]);
        let cur = snapshot([row("a", 14, &[(Metric::QueryTime, 160.0), (Metric::RowsSent, 5.0)])]);

        let out = builder().build(&cur, &prev, 600, 60);
        assert_eq!(out.resets, 0);
        assert_eq!(out.buckets.len(), 1);

        let b = &out.buckets[0];
        assert_eq!(b.num_queries, 4);
        assert_eq!(b.period_start_unix_secs, 600);
        assert_eq!(b.period_length_secs, 60);
        let qt = b.metric(Metric::QueryTime).expect("query time");
        assert_eq!(qt.sum, 60.0);
        assert_eq!(qt.count, 4);
        // Unchanged counters are left out.
        assert!(b.metric(Metric::RowsSent).is_none());
    }

    #[test]
    fn test_new_key_reports_absolute_values() {
        let prev = Snapshot::new();
        let cur = snapshot([row("a", 3, &[(Metric::RowsExamined, 30.0)])]);

        let out = builder().build(&cur, &prev, 0, 60);
        assert_eq!(out.buckets[0].num_queries, 3);
        assert_eq!(
            out.buckets[0].metric(Metric::RowsExamined).map(|v| v.sum),
            Some(30.0)
        );
        assert_eq!(out.resets, 0);
    }

    #[test]
    fn test_zero_delta_suppressed() {
        let prev = snapshot([row("a", 10, &[(Metric::QueryTime, 100.0)])]);
        let cur = prev.clone();

        let out = builder().build(&cur, &prev, 0, 60);
        assert!(out.buckets.is_empty());
    }

    #[test]
    fn test_reset_uses_current_value() {
        let prev = snapshot([row("a", 100, &[(Metric::QueryTime, 1_000.0)])]);
        let cur = snapshot([row("a", 7, &[(Metric::QueryTime, 1_500.0)])]);

        let out = builder().build(&cur, &prev, 0, 60);
        assert_eq!(out.resets, 1);
        let b = &out.buckets[0];
        assert_eq!(b.num_queries, 7);
        // Every counter restarted with the calls counter.
        assert_eq!(b.metric(Metric::QueryTime).map(|v| v.sum), Some(1_500.0));
    }

    #[test]
    fn test_field_reset_without_calls_reset() {
        let prev = snapshot([row("a", 10, &[(Metric::BlocksRead, 500.0)])]);
        let cur = snapshot([row("a", 12, &[(Metric::BlocksRead, 20.0)])]);

        let out = builder().build(&cur, &prev, 0, 60);
        assert_eq!(out.resets, 1);
        assert_eq!(
            out.buckets[0].metric(Metric::BlocksRead).map(|v| v.sum),
            Some(20.0)
        );
    }

    #[test]
    fn test_deltas_never_negative() {
        let pairs = [(0u64, 0u64), (5, 3), (3, 5), (u64::MAX, 0), (0, u64::MAX)];
        for (prev_calls, cur_calls) in pairs {
            let prev = snapshot([row("a", prev_calls, &[(Metric::QueryTime, prev_calls as f64)])]);
            let cur = snapshot([row("a", cur_calls, &[(Metric::QueryTime, cur_calls as f64)])]);

            let out = builder().build(&cur, &prev, 0, 60);
            for b in &out.buckets {
                let want = if cur_calls < prev_calls {
                    cur_calls
                } else {
                    cur_calls - prev_calls
                };
                assert_eq!(b.num_queries, want);
                for v in b.metrics.values() {
                    assert!(v.sum >= 0.0);
                }
            }
        }
    }

    #[test]
    fn test_buckets_sorted_and_stamped() {
        let cur = snapshot([row("b", 1, &[]), row("a", 1, &[]), row("c", 0, &[])]);
        let out = builder().build(&cur, &Snapshot::new(), 120, 30);

        let ids: Vec<&str> = out.buckets.iter().map(|b| b.query_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        for b in &out.buckets {
            assert_eq!(&*b.agent_id, "agent-1");
            assert_eq!(b.database, "app");
            assert_eq!(b.schema, "public");
        }
    }

    #[test]
    fn test_counter_row_json() {
        let json = r#"{
            "query_id": "abc",
            "fingerprint": "SELECT ?",
            "calls": 2,
            "counters": {"query_time": 1.5, "rows_sent": 4}
        }"#;
        let row: CounterRow = serde_json::from_str(json).expect("parse");
        assert_eq!(row.calls, 2);
        assert_eq!(row.counters.get(&Metric::QueryTime), Some(&1.5));
        assert_eq!(row.counters.get(&Metric::RowsSent), Some(&4.0));
        assert!(row.database.is_empty());
    }
}
