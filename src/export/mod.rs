pub mod health;
pub mod http;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::clock::unix_secs;
use crate::qan::Report;

use http::HttpExporter;

/// Exporter dispatches reports to the log or an HTTP endpoint.
///
/// Enum dispatch keeps `export` a plain async call without boxing futures.
pub enum Exporter {
    Log(LogExporter),
    Http(HttpExporter),
}

impl Exporter {
    /// Returns the exporter name for logging and metric labels.
    pub fn name(&self) -> &str {
        match self {
            Self::Log(e) => e.name(),
            Self::Http(e) => e.name(),
        }
    }

    /// Initialize the exporter.
    pub async fn start(&mut self) -> Result<()> {
        match self {
            Self::Log(e) => e.start().await,
            Self::Http(e) => e.start().await,
        }
    }

    /// Export one report.
    pub async fn export(&self, report: &Report) -> Result<()> {
        match self {
            Self::Log(e) => e.export(report).await,
            Self::Http(e) => e.export(report).await,
        }
    }

    /// Shut down the exporter.
    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Log(e) => e.stop().await,
            Self::Http(e) => e.stop().await,
        }
    }
}

/// Writes reports to the tracing log.
#[derive(Debug, Default)]
pub struct LogExporter;

impl LogExporter {
    pub fn name(&self) -> &str {
        "log"
    }

    pub async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    pub async fn export(&self, report: &Report) -> Result<()> {
        let queries: u64 = report.buckets.iter().map(|b| b.num_queries).sum();
        info!(
            window_start = unix_secs(report.window_start),
            window_end = unix_secs(report.window_end),
            buckets = report.buckets.len(),
            queries,
            "report"
        );

        if tracing::enabled!(tracing::Level::DEBUG) {
            for bucket in &report.buckets {
                let json = serde_json::to_string(bucket).context("serializing bucket")?;
                debug!(bucket = %json, "report bucket");
            }
        }

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
