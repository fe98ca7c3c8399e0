pub mod counters;
pub mod stats;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Numeric metric tracked per query fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Execution time in milliseconds.
    QueryTime,
    /// Time spent waiting for locks, in milliseconds.
    LockTime,
    RowsSent,
    RowsExamined,
    RowsAffected,
    /// Documents scanned (`nscannedObjects` / `docsExamined`).
    DocsScanned,
    /// Documents returned (`nreturned`).
    DocsReturned,
    /// Index keys scanned.
    KeysScanned,
    /// Response size in bytes.
    ResponseLength,
    /// Shared buffer hits.
    BlocksHit,
    /// Shared blocks read from disk.
    BlocksRead,
    /// Temporary tables created.
    TmpTables,
}

impl Metric {
    /// All metrics, in bucket order.
    pub const ALL: &'static [Metric] = &[
        Self::QueryTime,
        Self::LockTime,
        Self::RowsSent,
        Self::RowsExamined,
        Self::RowsAffected,
        Self::DocsScanned,
        Self::DocsReturned,
        Self::KeysScanned,
        Self::ResponseLength,
        Self::BlocksHit,
        Self::BlocksRead,
        Self::TmpTables,
    ];

    /// Returns the canonical metric name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QueryTime => "query_time",
            Self::LockTime => "lock_time",
            Self::RowsSent => "rows_sent",
            Self::RowsExamined => "rows_examined",
            Self::RowsAffected => "rows_affected",
            Self::DocsScanned => "docs_scanned",
            Self::DocsReturned => "docs_returned",
            Self::KeysScanned => "keys_scanned",
            Self::ResponseLength => "response_length",
            Self::BlocksHit => "blocks_hit",
            Self::BlocksRead => "blocks_read",
            Self::TmpTables => "tmp_tables",
        }
    }

    /// Looks up a metric by its canonical name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|m| m.as_str() == name)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finalized values of one metric within one bucket.
///
/// Zero fields are omitted on export; a zero `sum` means the metric is not
/// present in the bucket at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricValues {
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub sum: f64,
    #[serde(skip_serializing_if = "is_zero_u64")]
    pub count: u64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub min: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub max: f64,
    #[serde(skip_serializing_if = "is_zero_f64")]
    pub p99: f64,
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Emitted statistics for one (fingerprint, window) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsBucket {
    pub agent_id: Arc<str>,
    /// Stable short identifier for the fingerprint (digest or hash).
    pub query_id: String,
    pub fingerprint: String,
    pub database: String,
    pub schema: String,
    pub period_start_unix_secs: u64,
    pub period_length_secs: u32,
    pub num_queries: u64,
    /// Representative query text, when the source provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seen_unix_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_unix_secs: Option<u64>,
    /// Only metrics with a non-zero sum are present.
    pub metrics: BTreeMap<Metric, MetricValues>,
}

impl MetricsBucket {
    /// Returns the values of `metric`, if present in this bucket.
    pub fn metric(&self, metric: Metric) -> Option<&MetricValues> {
        self.metrics.get(&metric)
    }
}

/// Buckets produced for one closed window or one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub window_start: SystemTime,
    pub window_end: SystemTime,
    pub buckets: Vec<MetricsBucket>,
}

impl Report {
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

enum FeedReceiver<T> {
    Bounded(mpsc::Receiver<T>),
    Unbounded(mpsc::UnboundedReceiver<T>),
}

/// Shared receiving end of a pipeline channel.
///
/// Repeated `start` calls on a running component hand out clones of the
/// same feed, so every clone drains the same channel.
pub struct Feed<T> {
    rx: Arc<tokio::sync::Mutex<FeedReceiver<T>>>,
}

impl<T> Feed<T> {
    pub(crate) fn bounded(rx: mpsc::Receiver<T>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(FeedReceiver::Bounded(rx))),
        }
    }

    pub(crate) fn unbounded(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self {
            rx: Arc::new(tokio::sync::Mutex::new(FeedReceiver::Unbounded(rx))),
        }
    }

    /// Receives the next item, or `None` once the sender side is closed.
    pub async fn recv(&self) -> Option<T> {
        let mut rx = self.rx.lock().await;
        match &mut *rx {
            FeedReceiver::Bounded(rx) => rx.recv().await,
            FeedReceiver::Unbounded(rx) => rx.recv().await,
        }
    }

    /// Receives an item if one is immediately available.
    pub fn try_recv(&self) -> Option<T> {
        let mut rx = self.rx.try_lock().ok()?;
        match &mut *rx {
            FeedReceiver::Bounded(rx) => rx.try_recv().ok(),
            FeedReceiver::Unbounded(rx) => rx.try_recv().ok(),
        }
    }
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> fmt::Debug for Feed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Feed").finish_non_exhaustive()
    }
}

/// Splits `db.collection` into database and schema parts.
///
/// Only the first dot separates; a namespace without a dot is all database.
pub fn split_namespace(ns: &str) -> (&str, &str) {
    match ns.split_once('.') {
        Some((db, schema)) => (db, schema),
        None => (ns, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_name_round_trip() {
        for metric in Metric::ALL {
            assert_eq!(Metric::from_name(metric.as_str()), Some(*metric));
        }
        assert_eq!(Metric::from_name("nope"), None);
    }

    #[test]
    fn test_metric_serde_name_matches_as_str() {
        let json = serde_json::to_string(&Metric::DocsScanned).expect("serialize");
        assert_eq!(json, "\"docs_scanned\"");
        let parsed: Metric = serde_json::from_str("\"rows_examined\"").expect("deserialize");
        assert_eq!(parsed, Metric::RowsExamined);
    }

    #[test]
    fn test_metric_values_sparse_json() {
        let values = MetricValues {
            sum: 5.0,
            count: 2,
            ..Default::default()
        };
        let json = serde_json::to_string(&values).expect("serialize");
        assert_eq!(json, r#"{"sum":5.0,"count":2}"#);
    }

    #[test]
    fn test_split_namespace() {
        assert_eq!(split_namespace("collection.people"), ("collection", "people"));
        assert_eq!(split_namespace("db.a.b"), ("db", "a.b"));
        assert_eq!(split_namespace("admin"), ("admin", ""));
        assert_eq!(split_namespace(""), ("", ""));
    }

    #[tokio::test]
    async fn test_feed_clones_share_channel() {
        let (tx, rx) = mpsc::channel(4);
        let feed = Feed::bounded(rx);
        let other = feed.clone();

        tx.send(1u32).await.expect("send");
        tx.send(2u32).await.expect("send");

        assert_eq!(feed.recv().await, Some(1));
        assert_eq!(other.recv().await, Some(2));

        drop(tx);
        assert_eq!(feed.recv().await, None);
    }

    #[test]
    fn test_feed_try_recv_unbounded() {
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = Feed::unbounded(rx);

        assert_eq!(feed.try_recv(), None::<u8>);
        tx.send(7u8).expect("send");
        assert_eq!(feed.try_recv(), Some(7));
    }
}
