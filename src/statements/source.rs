use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};

use super::delta::{CounterRow, Snapshot};

/// A table of cumulative per-statement counters.
pub trait SnapshotSource: Send + Sync + 'static {
    /// Reads the full current table.
    fn snapshot(&self) -> impl Future<Output = Result<Snapshot>> + Send;
}

/// Counter table dumped as a JSON array of [`CounterRow`]s.
///
/// Rows sharing a query id are merged by keeping the last one.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotSource {
    path: PathBuf,
}

impl JsonFileSnapshotSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSource for JsonFileSnapshotSource {
    async fn snapshot(&self) -> Result<Snapshot> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("reading statements dump {}", self.path.display()))?;
        let rows: Vec<CounterRow> = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing statements dump {}", self.path.display()))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.query_id.clone(), row))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dump(name: &str, body: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "qan-statements-{}-{}.json",
            name,
            std::process::id()
        ));
        std::fs::write(&path, body).expect("write temp dump");
        path
    }

    #[tokio::test]
    async fn test_reads_rows_keyed_by_query_id() {
        let path = temp_dump(
            "rows",
            r#"[
                {"query_id": "q1", "fingerprint": "SELECT ?", "calls": 3},
                {"query_id": "q2", "fingerprint": "UPDATE t", "calls": 1,
                 "counters": {"rows_affected": 9}}
            ]"#,
        );

        let snap = JsonFileSnapshotSource::new(&path)
            .snapshot()
            .await
            .expect("snapshot");
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("q1").map(|r| r.calls), Some(3));
        assert_eq!(snap.get("q2").map(|r| r.fingerprint.as_str()), Some("UPDATE t"));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_malformed_dump() {
        let path = temp_dump("bad", "{not json");
        let err = JsonFileSnapshotSource::new(&path)
            .snapshot()
            .await
            .expect_err("malformed");
        assert!(err.to_string().contains("parsing statements dump"));

        let _ = std::fs::remove_file(path);
    }
}
