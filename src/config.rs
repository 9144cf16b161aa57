use anyhow::{Context, Result};
use chrono::NaiveTime;
use dirs::config_dir;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::run::RunSettings;
use crate::task::RepoFilter;

/// Main configuration structure
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    /// One sync server per hosting platform
    #[serde(default)]
    pub clients: Vec<ClientConfig>,

    /// What to propagate, per platform
    #[serde(default)]
    pub sync_files: Vec<SyncFileConfig>,

    /// Queue and executor tuning for a single run
    #[serde(default)]
    pub run: RunConfig,

    /// When the daemon starts runs
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint of the synchronization server for one platform
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ClientConfig {
    /// The code platform, e.g. "gitee"
    pub platform: String,

    /// Base URL of the platform's sync server
    pub endpoint: String,

    /// Per-call timeout
    #[serde(default = "default_client_timeout")]
    pub timeout: String, // "3s"
}

/// Files to propagate to the selected repositories of one platform
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct SyncFileConfig {
    /// The code platform
    pub platform: String,

    /// The list of files to be synchronized
    #[serde(default)]
    pub file_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub org_repos: Vec<OrgRepos>,
}

/// Org selector: which repos of an organization take part
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct OrgRepos {
    pub org: String,

    /// Allow-list. When set the repos are used as-is, without listing the org
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<String>,

    /// Deny-list applied to the repos discovered in the org
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_repos: Vec<String>,

    /// List the org anyway and keep only allow-listed repos that exist
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub verify_repos: bool,
}

/// Run tuning
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RunConfig {
    /// Fixed capacity of the task queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of parallel executors
    #[serde(default = "default_executors")]
    pub executors: usize,

    /// Attempts per task before it is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long an executor waits on an empty queue before re-checking
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String, // "3s"

    /// How long an executor waits on a full queue before running inline
    #[serde(default = "default_push_timeout")]
    pub push_timeout: String, // "10ms"
}

/// Daemon schedule
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScheduleConfig {
    /// Local time of the first run, HH:MM
    #[serde(default = "default_start_time")]
    pub start_time: String, // "01:00"

    /// Interval between two runs
    #[serde(default = "default_interval")]
    pub interval: String, // "24h"
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default = "default_log_format")]
    pub format: String, // "compact", "pretty", "full"
}

// Default value functions
fn default_client_timeout() -> String {
    "3s".to_string()
}
fn default_queue_capacity() -> usize {
    500
}
fn default_executors() -> usize {
    3
}
fn default_max_retries() -> u32 {
    3
}
fn default_idle_timeout() -> String {
    "3s".to_string()
}
fn default_push_timeout() -> String {
    "10ms".to_string()
}
fn default_start_time() -> String {
    "01:00".to_string()
}
fn default_interval() -> String {
    "24h".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            executors: default_executors(),
            max_retries: default_max_retries(),
            idle_timeout: default_idle_timeout(),
            push_timeout: default_push_timeout(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            start_time: default_start_time(),
            interval: default_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Parse duration strings like "10ms", "3s", "30m", "24h", "1d".
/// A bare number is taken as seconds.
pub fn parse_duration(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    };
    let trimmed = value.trim().to_lowercase();

    let (number, unit_ms) = if let Some(v) = trimmed.strip_suffix("ms") {
        (v, 1)
    } else if let Some(v) = trimmed.strip_suffix('s') {
        (v, 1_000)
    } else if let Some(v) = trimmed.strip_suffix('m') {
        (v, 60_000)
    } else if let Some(v) = trimmed.strip_suffix('h') {
        (v, 3_600_000)
    } else if let Some(v) = trimmed.strip_suffix('d') {
        (v, 86_400_000)
    } else {
        (trimmed.as_str(), 1_000)
    };

    let number: u64 = number.trim().parse().map_err(|_| invalid())?;
    number
        .checked_mul(unit_ms)
        .map(Duration::from_millis)
        .ok_or_else(invalid)
}

/// Parse a HH:MM wall-clock time
pub fn parse_start_time(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|_| ConfigError::InvalidStartTime {
        value: value.to_string(),
    })
}

impl OrgRepos {
    /// The allow/deny rule of this selector
    pub fn filter(&self) -> RepoFilter {
        RepoFilter::from_lists(&self.repos, &self.excluded_repos)
    }

    fn validate(&self, platform: &str) -> Result<(), ConfigError> {
        if self.org.trim().is_empty() {
            return Err(ConfigError::MissingOrg {
                platform: platform.to_string(),
            });
        }

        if !self.repos.is_empty() && !self.excluded_repos.is_empty() {
            return Err(ConfigError::ConflictingRepoFilters {
                org: self.org.clone(),
            });
        }

        Ok(())
    }
}

impl SyncFileConfig {
    pub fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.platform.trim().is_empty() {
            return Err(ConfigError::MissingPlatform { index });
        }

        if self.file_names.is_empty() {
            return Err(ConfigError::MissingFileNames {
                platform: self.platform.clone(),
            });
        }

        for item in &self.org_repos {
            item.validate(&self.platform)?;
        }

        Ok(())
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration("clients.timeout", &self.timeout)
    }
}

impl ScheduleConfig {
    pub fn start_time(&self) -> Result<NaiveTime, ConfigError> {
        parse_start_time(&self.start_time)
    }

    pub fn interval(&self) -> Result<Duration, ConfigError> {
        let interval = parse_duration("schedule.interval", &self.interval)?;
        if interval.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "schedule.interval",
            });
        }
        Ok(interval)
    }
}

impl Config {
    /// Load configuration from the default location or create a default config
    pub fn load_or_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load(&config_path)
        } else {
            let config = Self::default();

            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
            }

            config.save(&config_path)?;

            tracing::info!("Created default configuration at: {:?}", config_path);
            Ok(config)
        }
    }

    /// Load and validate configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let expanded = shellexpand::full(&path.to_string_lossy())
            .context("Failed to expand config file path")?
            .into_owned();
        let path = PathBuf::from(expanded);

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {:?}", path))?;

        Ok(config)
    }

    /// Parse configuration from YAML without validating it
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self).context("Failed to serialize configuration")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("repo-file-sync").join("config.yml"))
    }

    /// Reject anything the core must never see
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, client) in self.clients.iter().enumerate() {
            if client.platform.trim().is_empty() {
                return Err(ConfigError::MissingClientPlatform { index });
            }
            if client.endpoint.trim().is_empty() {
                return Err(ConfigError::MissingEndpoint {
                    platform: client.platform.clone(),
                });
            }
            client.timeout()?;
        }

        for (index, item) in self.sync_files.iter().enumerate() {
            item.validate(index)?;
        }

        self.run_settings()?;
        self.schedule.start_time()?;
        self.schedule.interval()?;

        Ok(())
    }

    /// Typed run settings for the core
    pub fn run_settings(&self) -> Result<RunSettings, ConfigError> {
        let run = &self.run;

        if run.queue_capacity == 0 {
            return Err(ConfigError::NotPositive {
                field: "run.queue_capacity",
            });
        }
        if run.executors == 0 {
            return Err(ConfigError::NotPositive {
                field: "run.executors",
            });
        }
        if run.max_retries == 0 {
            return Err(ConfigError::NotPositive {
                field: "run.max_retries",
            });
        }

        let idle_timeout = parse_duration("run.idle_timeout", &run.idle_timeout)?;
        if idle_timeout.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "run.idle_timeout",
            });
        }

        Ok(RunSettings {
            queue_capacity: run.queue_capacity,
            executors: run.executors,
            max_retries: run.max_retries,
            idle_timeout,
            push_timeout: parse_duration("run.push_timeout", &run.push_timeout)?,
        })
    }

    /// Platforms that have sync files configured but no client
    pub fn platforms_without_client(&self) -> Vec<&str> {
        let clients: HashSet<&str> = self.clients.iter().map(|c| c.platform.as_str()).collect();
        let mut missing: Vec<&str> = self
            .sync_files
            .iter()
            .map(|item| item.platform.as_str())
            .filter(|platform| !clients.contains(platform))
            .collect();
        missing.sort_unstable();
        missing.dedup();
        missing
    }
}
