//! Daemon configuration file.
//!
//! Every field has a default, so an empty or missing file is valid.
//! Durations are written as `"500ms"`, `"30s"`, `"5m"` or `"1h"`; a bare
//! number means seconds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fleetgrid_rollout::RolloutConfig;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration {value:?} for {field}")]
    Duration { field: &'static str, value: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// The TOML file as written by the operator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub scheduler: SchedulerSection,
    pub rollout: RolloutSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log_format: LogFormat,
    /// JSON file with the agents and releases of the in-process fleet.
    pub fleet_file: Option<PathBuf>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 8443,
            data_dir: PathBuf::from("/var/lib/fleetgrid"),
            log_format: LogFormat::Text,
            fleet_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub tick_interval: String,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            tick_interval: "5s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RolloutSection {
    pub failure_threshold: f64,
    pub max_attempts: u32,
    pub retry_backoff: String,
    pub max_retry_backoff: String,
    pub update_timeout: String,
    pub command_timeout: String,
    pub max_concurrency: usize,
    pub manual_batch_size: u32,
    pub catch_up: bool,
    pub lock_timeout: String,
}

impl Default for RolloutSection {
    fn default() -> Self {
        Self {
            failure_threshold: 0.1,
            max_attempts: 3,
            retry_backoff: "5s".to_string(),
            max_retry_backoff: "60s".to_string(),
            update_timeout: "5m".to_string(),
            command_timeout: "10s".to_string(),
            max_concurrency: 16,
            manual_batch_size: 1,
            catch_up: true,
            lock_timeout: "2s".to_string(),
        }
    }
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log_format: LogFormat,
    pub fleet_file: Option<PathBuf>,
    pub tick_interval: Duration,
    pub rollout: RolloutConfig,
}

impl FileConfig {
    /// Read and parse a config file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Resolve duration strings into settings.
    pub fn into_settings(self) -> ConfigResult<Settings> {
        let r = &self.rollout;
        let rollout = RolloutConfig {
            failure_threshold: r.failure_threshold,
            max_attempts: r.max_attempts,
            retry_backoff: parse_duration("rollout.retry_backoff", &r.retry_backoff)?,
            max_retry_backoff: parse_duration("rollout.max_retry_backoff", &r.max_retry_backoff)?,
            update_timeout: parse_duration("rollout.update_timeout", &r.update_timeout)?,
            command_timeout: parse_duration("rollout.command_timeout", &r.command_timeout)?,
            max_concurrency: r.max_concurrency,
            manual_batch_size: r.manual_batch_size,
            catch_up: r.catch_up,
            lock_timeout: parse_duration("rollout.lock_timeout", &r.lock_timeout)?,
        };

        Ok(Settings {
            tick_interval: parse_duration("scheduler.tick_interval", &self.scheduler.tick_interval)?,
            port: self.server.port,
            data_dir: self.server.data_dir,
            log_format: self.server.log_format,
            fleet_file: self.server.fleet_file,
            rollout,
        })
    }
}

/// Parse a duration string like `"500ms"`, `"30s"`, `"5m"` or `"1h"`.
pub fn parse_duration(field: &'static str, value: &str) -> ConfigResult<Duration> {
    let invalid = || ConfigError::Duration {
        field,
        value: value.to_string(),
    };

    let s = value.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits.parse().map_err(|_| invalid())?;

    match unit.trim() {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(n.saturating_mul(3600))),
        _ => Err(invalid()),
    }
}
