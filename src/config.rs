use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the tracefeed agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How often a pass runs. Default: 5m.
    #[serde(default = "default_read_interval", with = "humantime_serde")]
    pub read_interval: Duration,

    /// Inactive files last written longer ago than this are ignored. Default: 3 days.
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,

    /// Safety margin subtracted from "now" when reading the active file. Default: 10s.
    #[serde(default = "default_flush_lag", with = "humantime_serde")]
    pub flush_lag: Duration,

    /// Directory holding the trace files, unless a provider overrides it.
    #[serde(default)]
    pub trace_directory: Option<PathBuf>,

    /// Where markers for fully processed files live.
    /// Default: an `archived` directory next to the trace directory.
    #[serde(default)]
    pub marker_directory: Option<PathBuf>,

    /// Where per-provider checkpoints are persisted.
    #[serde(default)]
    pub checkpoint_directory: PathBuf,

    /// Optional decode manifest (YAML).
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,

    /// Records handed to sinks per delivery. Default: 512.
    #[serde(default = "default_dispatch_batch_size")]
    pub dispatch_batch_size: usize,

    /// Retry policy for opening and starting to read a trace file.
    #[serde(default = "default_read_retry")]
    pub read_retry: RetryConfig,

    /// Retry policy for persisting checkpoints.
    #[serde(default = "default_checkpoint_retry")]
    pub checkpoint_retry: RetryConfig,

    /// Trace file groups to ingest.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Built-in sink configuration.
    #[serde(default)]
    pub sinks: SinksConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first. Default: 3.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry. Default: 100ms.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for any single delay. Default: 2s.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

/// One trace file group.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    /// Glob matched against file names, e.g. "fabric_*.trc".
    pub name_pattern: String,

    /// Name used in logs and metrics. Default: the pattern.
    #[serde(default)]
    pub friendly_name: Option<String>,

    /// Checkpoint entry for this group. Default: the friendly name.
    #[serde(default)]
    pub checkpoint_key: Option<String>,

    /// Overrides `trace_directory` for this provider.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl ProviderConfig {
    pub fn friendly_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.name_pattern)
    }

    pub fn checkpoint_key(&self) -> &str {
        self.checkpoint_key
            .as_deref()
            .unwrap_or_else(|| self.friendly_name())
    }
}

/// Built-in sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SinksConfig {
    #[serde(default)]
    pub memory: MemorySinkConfig,

    #[serde(default)]
    pub buffered: BufferedSinkConfig,
}

/// Bounded in-memory sink.
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySinkConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Records kept before the oldest are dropped. Default: 65536.
    #[serde(default = "default_memory_capacity")]
    pub capacity: usize,

    /// Keep decoded events instead of raw records.
    #[serde(default)]
    pub decoded: bool,
}

/// Per-pass cache file sink.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferedSinkConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Directory receiving `Cache_*.tmp` and `Cache_*.dat` files.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Delivered cache files older than this are deleted. Default: 3 days.
    #[serde(default = "default_cache_retention", with = "humantime_serde")]
    pub retention: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address for the metrics server. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_read_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_retention() -> Duration {
    Duration::from_secs(3 * 24 * 60 * 60)
}

fn default_flush_lag() -> Duration {
    Duration::from_secs(10)
}

fn default_dispatch_batch_size() -> usize {
    512
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_read_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: default_max_attempts(),
        initial_backoff: default_initial_backoff(),
        max_backoff: default_max_backoff(),
    }
}

fn default_checkpoint_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: default_max_attempts(),
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(500),
    }
}

fn default_cache_retention() -> Duration {
    Duration::from_secs(3 * 24 * 60 * 60)
}

fn default_memory_capacity() -> usize {
    65_536
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            read_interval: default_read_interval(),
            retention: default_retention(),
            flush_lag: default_flush_lag(),
            trace_directory: None,
            marker_directory: None,
            checkpoint_directory: PathBuf::new(),
            manifest_path: None,
            dispatch_batch_size: default_dispatch_batch_size(),
            read_retry: default_read_retry(),
            checkpoint_retry: default_checkpoint_retry(),
            providers: Vec::new(),
            sinks: SinksConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for MemorySinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capacity: default_memory_capacity(),
            decoded: false,
        }
    }
}

impl Default for BufferedSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: None,
            retention: default_cache_retention(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
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
    ///
    /// An empty provider list passes: the producer logs it at startup and
    /// stays idle.
    pub fn validate(&self) -> Result<()> {
        if self.read_interval.is_zero() {
            bail!("read_interval must be positive");
        }

        if self.dispatch_batch_size == 0 {
            bail!("dispatch_batch_size must be positive");
        }

        if self.checkpoint_directory.as_os_str().is_empty() {
            bail!("checkpoint_directory is required");
        }

        self.read_retry.validate("read_retry")?;
        self.checkpoint_retry.validate("checkpoint_retry")?;

        let mut keys = HashSet::with_capacity(self.providers.len());
        for (idx, provider) in self.providers.iter().enumerate() {
            if provider.name_pattern.is_empty() {
                bail!("providers[{idx}].name_pattern is required");
            }

            glob::Pattern::new(&provider.name_pattern).with_context(|| {
                format!(
                    "providers[{idx}].name_pattern is not a valid glob: {}",
                    provider.name_pattern
                )
            })?;

            if self.provider_directory(provider).is_none() {
                bail!("providers[{idx}]: trace_directory or directory is required");
            }

            if !keys.insert(provider.checkpoint_key()) {
                bail!(
                    "providers[{idx}]: duplicate checkpoint_key {}",
                    provider.checkpoint_key()
                );
            }
        }

        if self.sinks.memory.enabled && self.sinks.memory.capacity == 0 {
            bail!("sinks.memory.capacity must be positive when enabled");
        }

        if self.sinks.buffered.enabled {
            if self.sinks.buffered.directory.is_none() {
                bail!("sinks.buffered.directory is required when enabled");
            }
            if self.sinks.buffered.retention.is_zero() {
                bail!("sinks.buffered.retention must be positive when enabled");
            }
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }

    /// Log filter to install: the command-line value wins over the file.
    pub fn log_level<'a>(&'a self, cli: Option<&'a str>) -> &'a str {
        cli.unwrap_or(&self.log_level)
    }

    /// Trace directory for `provider`, honouring its override.
    pub fn provider_directory<'a>(&'a self, provider: &'a ProviderConfig) -> Option<&'a Path> {
        provider
            .directory
            .as_deref()
            .or(self.trace_directory.as_deref())
    }
}

impl RetryConfig {
    fn validate(&self, key: &str) -> Result<()> {
        if self.max_attempts == 0 {
            bail!("{key}.max_attempts must be at least 1");
        }

        if self.initial_backoff > self.max_backoff {
            bail!("{key}.initial_backoff must not exceed {key}.max_backoff");
        }

        Ok(())
    }
}
