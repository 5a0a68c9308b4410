//! Driver configuration, loaded once at startup from a TOML file.
//!
//! Unknown keys anywhere in the file are a startup error: a typo in an
//! operator config should fail loudly, not silently fall back to a
//! default.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

/// Errors loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path:?}: {source}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for the expected shape.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A numeric field that must be positive was zero.
    #[error("{field} must be greater than zero")]
    Zero {
        /// The offending field.
        field: &'static str,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct VendorSection {
    #[serde(default = "default_endpoint")]
    pub(crate) endpoint: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub(crate) connect_timeout_secs: u64,

    #[serde(default = "default_call_timeout_secs")]
    pub(crate) call_timeout_secs: u64,
}

impl Default for VendorSection {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            connect_timeout_secs: default_connect_timeout_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_endpoint() -> String {
    "http://api.tushare.pro".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RateLimitSection {
    #[serde(default = "default_per_minute")]
    pub(crate) default_per_minute: usize,

    #[serde(default)]
    pub(crate) per_task: HashMap<String, usize>,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            default_per_minute: default_per_minute(),
            per_task: HashMap::new(),
        }
    }
}

fn default_per_minute() -> usize {
    500
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct WorkersSection {
    #[serde(default = "default_fast_workers")]
    pub(crate) fast: usize,
}

impl Default for WorkersSection {
    fn default() -> Self {
        Self {
            fast: default_fast_workers(),
        }
    }
}

fn default_fast_workers() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RetrySection {
    #[serde(default = "default_download_attempts")]
    pub(crate) max_download_attempts: u32,

    #[serde(default = "default_persist_attempts")]
    pub(crate) max_persist_attempts: u32,

    #[serde(default = "default_init_backoff_ms")]
    pub(crate) init_backoff_ms: u64,

    #[serde(default = "default_max_backoff_secs")]
    pub(crate) max_backoff_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_download_attempts: default_download_attempts(),
            max_persist_attempts: default_persist_attempts(),
            init_backoff_ms: default_init_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_download_attempts() -> u32 {
    3
}

fn default_persist_attempts() -> u32 {
    2
}

fn default_init_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PlannerSection {
    #[serde(default = "default_symbol_source")]
    pub(crate) symbol_source: String,

    #[serde(default = "default_symbol_column")]
    pub(crate) symbol_column: String,

    #[serde(default)]
    pub(crate) symbols: Vec<String>,
}

impl Default for PlannerSection {
    fn default() -> Self {
        Self {
            symbol_source: default_symbol_source(),
            symbol_column: default_symbol_column(),
            symbols: Vec::new(),
        }
    }
}

fn default_symbol_source() -> String {
    "stock_basic".to_string()
}

fn default_symbol_column() -> String {
    "ts_code".to_string()
}

/// The whole driver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct Config {
    /// Root directory of the data lake.
    #[serde(default = "default_lake_root")]
    pub(crate) lake_root: PathBuf,

    /// Path to an operator catalogue file; the built-in catalogue is
    /// used when absent.
    #[serde(default)]
    pub(crate) catalogue: Option<PathBuf>,

    #[serde(default)]
    pub(crate) vendor: VendorSection,

    #[serde(default)]
    pub(crate) rate_limit: RateLimitSection,

    #[serde(default)]
    pub(crate) workers: WorkersSection,

    #[serde(default)]
    pub(crate) retry: RetrySection,

    #[serde(default)]
    pub(crate) planner: PlannerSection,
}

fn default_lake_root() -> PathBuf {
    PathBuf::from("./lake")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lake_root: default_lake_root(),
            catalogue: None,
            vendor: VendorSection::default(),
            rate_limit: RateLimitSection::default(),
            workers: WorkersSection::default(),
            retry: RetrySection::default(),
            planner: PlannerSection::default(),
        }
    }
}

impl Config {
    pub(crate) fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limit.default_per_minute == 0 {
            return Err(ConfigError::Zero {
                field: "rate_limit.default_per_minute",
            });
        }
        if self.rate_limit.per_task.values().any(|v| *v == 0) {
            return Err(ConfigError::Zero {
                field: "rate_limit.per_task",
            });
        }
        if self.workers.fast == 0 {
            return Err(ConfigError::Zero {
                field: "workers.fast",
            });
        }
        if self.retry.max_download_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "retry.max_download_attempts",
            });
        }
        if self.retry.max_persist_attempts == 0 {
            return Err(ConfigError::Zero {
                field: "retry.max_persist_attempts",
            });
        }
        Ok(())
    }

    pub(crate) fn rate_limit_config(&self) -> rate_limit::RateLimitConfig {
        rate_limit::RateLimitConfig {
            default_per_minute: NonZeroUsize::new(self.rate_limit.default_per_minute)
                .expect("validated non-zero"),
            per_task: self
                .rate_limit
                .per_task
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        NonZeroUsize::new(*v).expect("validated non-zero"),
                    )
                })
                .collect(),
        }
    }

    pub(crate) fn vendor_config(&self, token: String) -> vendor_api::VendorConfig {
        vendor_api::VendorConfig {
            endpoint: self.vendor.endpoint.clone(),
            token,
            connect_timeout: Duration::from_secs(self.vendor.connect_timeout_secs),
            call_timeout: Duration::from_secs(self.vendor.call_timeout_secs),
        }
    }

    pub(crate) fn orchestrator_config(&self) -> orchestrator::OrchestratorConfig {
        orchestrator::OrchestratorConfig {
            fast_workers: self.workers.fast,
            max_download_attempts: self.retry.max_download_attempts,
            max_persist_attempts: self.retry.max_persist_attempts,
            retry_backoff: backoff::BackoffConfig {
                init_backoff: Duration::from_millis(self.retry.init_backoff_ms),
                max_backoff: Duration::from_secs(self.retry.max_backoff_secs),
                base: 3.0,
            },
            planner: orchestrator::PlannerConfig {
                symbol_source: self.planner.symbol_source.clone(),
                symbol_column: self.planner.symbol_column.clone(),
                symbol_overrides: self
                    .planner
                    .symbols
                    .iter()
                    .map(|s| data_types::Symbol::new(s.clone()))
                    .collect(),
            },
        }
    }
}
