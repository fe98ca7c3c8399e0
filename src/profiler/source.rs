use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::debug;

use super::observation::record_timestamp;

/// A tailable store of profile documents.
pub trait ProfileSource: Send + Sync + 'static {
    type Cursor: ProfileCursor;

    /// Opens a cursor over records with `since < ts <= until`, ordered by
    /// timestamp.
    fn open(
        &self,
        since: SystemTime,
        until: SystemTime,
    ) -> impl Future<Output = Result<Self::Cursor>> + Send;
}

/// Iterator over raw profile records.
pub trait ProfileCursor: Send {
    /// Returns the next record, or `None` once exhausted.
    fn next_record(&mut self) -> impl Future<Output = Result<Option<Value>>> + Send;
}

/// Cursor over records already loaded in memory.
#[derive(Debug, Default)]
pub struct VecCursor {
    records: VecDeque<Value>,
}

impl VecCursor {
    pub fn new(records: impl IntoIterator<Item = Value>) -> Self {
        Self {
            records: records.into_iter().collect(),
        }
    }
}

impl ProfileCursor for VecCursor {
    async fn next_record(&mut self) -> Result<Option<Value>> {
        Ok(self.records.pop_front())
    }
}

/// Profile log written as newline-delimited JSON documents.
///
/// Each open re-reads the file and keeps the records inside the requested
/// range. Lines that are not JSON, or whose timestamp cannot be read, are
/// skipped.
#[derive(Debug, Clone)]
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ProfileSource for JsonLinesSource {
    type Cursor = VecCursor;

    async fn open(&self, since: SystemTime, until: SystemTime) -> Result<VecCursor> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("reading profile log {}", self.path.display()))?;

        let mut records: Vec<(SystemTime, Value)> = Vec::new();
        let mut skipped = 0usize;
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Ok(value) = serde_json::from_str::<Value>(line) else {
                skipped += 1;
                continue;
            };
            let Some(ts) = record_timestamp(&value) else {
                skipped += 1;
                continue;
            };
            if ts > since && ts <= until {
                records.push((ts, value));
            }
        }

        if skipped > 0 {
            debug!(
                path = %self.path.display(),
                skipped,
                "skipped unreadable profile log lines"
            );
        }

        records.sort_by_key(|(ts, _)| *ts);
        Ok(VecCursor::new(records.into_iter().map(|(_, v)| v)))
    }
}
