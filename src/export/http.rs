use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::HttpExportConfig;
use crate::qan::{MetricsBucket, Report};

/// One NDJSON row: a bucket stamped with its report window.
#[derive(Debug, Serialize)]
struct BucketJson<'a> {
    window_start: &'a str,
    window_end: &'a str,
    #[serde(flatten)]
    bucket: &'a MetricsBucket,
}

/// HTTP NDJSON exporter.
///
/// Each report is sent as one POST, one bucket per line. A failed request
/// is returned to the caller, which logs and counts it.
pub struct HttpExporter {
    cfg: HttpExportConfig,
    client: Option<reqwest::Client>,
}

impl HttpExporter {
    /// Creates a new HTTP exporter with the given configuration.
    pub fn new(cfg: HttpExportConfig) -> Self {
        Self { cfg, client: None }
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        "http"
    }

    /// Builds the HTTP client.
    pub async fn start(&mut self) -> Result<()> {
        if self.cfg.address.is_empty() {
            bail!("http export address is required");
        }

        let client = reqwest::Client::builder()
            .timeout(self.cfg.timeout)
            .build()
            .context("building HTTP client")?;
        self.client = Some(client);

        tracing::info!(
            address = %self.cfg.address,
            timeout = ?self.cfg.timeout,
            "HTTP exporter started",
        );

        Ok(())
    }

    /// Sends a report. Empty reports and an unstarted exporter are no-ops.
    pub async fn export(&self, report: &Report) -> Result<()> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        if report.is_empty() {
            return Ok(());
        }

        let body = encode_ndjson(report)?;
        let bytes = body.len();

        let mut request = client
            .post(&self.cfg.address)
            .header("Content-Type", "application/x-ndjson")
            .body(body);

        for (k, v) in &self.cfg.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request
            .send()
            .await
            .context("sending HTTP export request")?;

        let status = resp.status();
        // Drain body for connection reuse.
        let _ = resp.bytes().await;

        if !status.is_success() {
            bail!("HTTP export unexpected status: {status}");
        }

        tracing::debug!(
            buckets = report.buckets.len(),
            bytes,
            "exported report via HTTP",
        );

        Ok(())
    }

    /// Drops the client; in-flight requests finish on their own.
    pub async fn stop(&mut self) -> Result<()> {
        self.client.take();
        Ok(())
    }
}

/// Serializes every bucket of `report` as one JSON line.
fn encode_ndjson(report: &Report) -> Result<Vec<u8>> {
    let window_start = format_datetime(report.window_start);
    let window_end = format_datetime(report.window_end);

    let mut buf = Vec::with_capacity(report.buckets.len() * 256);
    for bucket in &report.buckets {
        let row = BucketJson {
            window_start: &window_start,
            window_end: &window_end,
            bucket,
        };
        serde_json::to_writer(&mut buf, &row).context("serializing bucket to JSON")?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Formats a SystemTime as "YYYY-MM-DD HH:MM:SS.mmm" in UTC.
fn format_datetime(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}
