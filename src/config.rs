use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::profiler::aggregator::AggregatorConfig;
use crate::profiler::collector::CollectorConfig;
use crate::statements::PollerConfig;

/// Top-level configuration for the qan agent.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Identifies this agent in every emitted bucket.
    #[serde(default)]
    pub agent_id: String,

    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Streaming source: a tailed profiler log.
    #[serde(default)]
    pub profiler: ProfilerConfig,

    /// Poll-based source: cumulative statement counters.
    #[serde(default)]
    pub statements: StatementsConfig,

    /// Report export configuration.
    #[serde(default)]
    pub export: ExportConfig,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Tailed profiler log configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProfilerConfig {
    /// Enable the profiler pipeline. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Newline-delimited JSON profile log.
    #[serde(default)]
    pub path: PathBuf,

    /// Aggregation window duration. Default: 60s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Observation channel capacity. Default: 100.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Fixed delay before reopening a failed cursor. Default: 1s.
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Pause after an exhausted cursor. Default: 1s.
    #[serde(default = "default_tail_interval", with = "humantime_serde")]
    pub tail_interval: Duration,
}

/// Statement counter polling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatementsConfig {
    /// Enable the statements pipeline. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// JSON dump of the statement counter table.
    #[serde(default)]
    pub path: PathBuf,

    /// Poll interval. Default: 60s.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How long a statement outlives its source row. Default: 30m.
    #[serde(default = "default_cache_retain", with = "humantime_serde")]
    pub cache_retain: Duration,

    /// Maximum cached statements. Default: 5000.
    #[serde(default = "default_cache_size_limit")]
    pub cache_size_limit: usize,
}

/// Report export configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ExportConfig {
    /// HTTP NDJSON export.
    #[serde(default)]
    pub http: HttpExportConfig,
}

/// HTTP export configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpExportConfig {
    /// Enable the HTTP exporter. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// HTTP endpoint to send reports to.
    #[serde(default)]
    pub address: String,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_channel_capacity() -> usize {
    100
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_tail_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_cache_retain() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_cache_size_limit() -> usize {
    5000
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(10)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            log_level: default_log_level(),
            health: HealthConfig::default(),
            profiler: ProfilerConfig::default(),
            statements: StatementsConfig::default(),
            export: ExportConfig::default(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            interval: default_interval(),
            channel_capacity: default_channel_capacity(),
            reconnect_delay: default_reconnect_delay(),
            tail_interval: default_tail_interval(),
        }
    }
}

impl Default for StatementsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            interval: default_interval(),
            cache_retain: default_cache_retain(),
            cache_size_limit: default_cache_size_limit(),
        }
    }
}

impl Default for HttpExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            headers: HashMap::new(),
            timeout: default_http_timeout(),
        }
    }
}

// --- Component configs ---

impl ProfilerConfig {
    pub fn aggregator(&self, agent_id: &str) -> AggregatorConfig {
        AggregatorConfig::new(agent_id).with_interval(self.interval)
    }

    pub fn collector(&self) -> CollectorConfig {
        CollectorConfig {
            channel_capacity: self.channel_capacity,
            reconnect_delay: self.reconnect_delay,
            tail_interval: self.tail_interval,
        }
    }
}

impl StatementsConfig {
    pub fn poller(&self, agent_id: &str) -> PollerConfig {
        PollerConfig {
            agent_id: agent_id.into(),
            interval: self.interval,
            cache_retain: self.cache_retain,
            cache_size_limit: self.cache_size_limit,
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.is_empty() {
            bail!("agent_id is required");
        }

        if !self.profiler.enabled && !self.statements.enabled {
            bail!("at least one of profiler.enabled or statements.enabled must be true");
        }

        if self.profiler.enabled {
            let p = &self.profiler;
            if p.path.as_os_str().is_empty() {
                bail!("profiler.path is required when enabled");
            }
            if p.interval.is_zero() {
                bail!("profiler.interval must be positive");
            }
            if p.channel_capacity == 0 {
                bail!("profiler.channel_capacity must be positive");
            }
            if p.reconnect_delay.is_zero() {
                bail!("profiler.reconnect_delay must be positive");
            }
            if p.tail_interval.is_zero() {
                bail!("profiler.tail_interval must be positive");
            }
        }

        if self.statements.enabled {
            let s = &self.statements;
            if s.path.as_os_str().is_empty() {
                bail!("statements.path is required when enabled");
            }
            if s.interval.is_zero() {
                bail!("statements.interval must be positive");
            }
        }

        if self.export.http.enabled {
            if self.export.http.address.is_empty() {
                bail!("export.http.address is required when enabled");
            }
            if self.export.http.timeout.is_zero() {
                bail!("export.http.timeout must be positive");
            }
        }

        Ok(())
    }
}
