//! Harness configuration
//!
//! Loaded from TOML, then optionally overridden by the environment variables
//! the test suites already export (`MAX_RETRIES`, `RETRY_DELAY`, ...). The
//! config is passed by value into the orchestrator and runner; nothing reads
//! it through a global.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Top-level harness configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub parallel: ParallelConfig,
    pub artifacts: ArtifactsConfig,
    pub logging: LoggingConfig,
}

/// Retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per session, including the first
    pub max_attempts: u32,

    /// Delay before the second attempt
    pub base_delay_ms: u64,

    /// Growth factor applied to each further delay
    pub backoff_multiplier: f64,

    /// Upper bound for any single delay
    pub max_delay_ms: Option<u64>,

    /// Whether per-attempt timeouts are retried
    pub retry_timeouts: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 1000,
            backoff_multiplier: 1.0,
            max_delay_ms: None,
            retry_timeouts: false,
        }
    }
}

/// Timeouts, in milliseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Limit for one attempt, acquisition included
    pub attempt_ms: Option<u64>,

    /// Limit for a whole session, retry waits included
    pub session_ms: Option<u64>,
}

impl TimeoutConfig {
    pub fn attempt(&self) -> Option<Duration> {
        self.attempt_ms.map(Duration::from_millis)
    }

    pub fn session(&self) -> Option<Duration> {
        self.session_ms.map(Duration::from_millis)
    }
}

/// Parallel execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Maximum number of sessions running at once
    pub max_workers: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self { max_workers: 4 }
    }
}

/// Artifact output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub path: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./test-results"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    #[default]
    Simple,
}

impl std::str::FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "simple" => Ok(LogFormat::Simple),
            other => Err(Error::InvalidConfig(format!(
                "log format must be one of json, simple (got {})",
                other
            ))),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Simple,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl HarnessConfig {
    /// Load configuration from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment-style overrides through `lookup`.
    ///
    /// `MAX_RETRIES` counts retries after the first attempt, so it maps to
    /// `max_attempts = MAX_RETRIES + 1`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(retries) = lookup("MAX_RETRIES") {
            let retries: u32 = parse_var("MAX_RETRIES", &retries)?;
            self.retry.max_attempts = retries.saturating_add(1);
        }
        if let Some(delay) = lookup("RETRY_DELAY") {
            self.retry.base_delay_ms = parse_var("RETRY_DELAY", &delay)?;
        }
        if let Some(timeout) = lookup("TEST_TIMEOUT") {
            self.timeouts.attempt_ms = Some(parse_var("TEST_TIMEOUT", &timeout)?);
        }
        if let Some(workers) = lookup("MAX_WORKERS") {
            self.parallel.max_workers = parse_var("MAX_WORKERS", &workers)?;
        }
        if let Some(path) = lookup("ARTIFACTS_PATH") {
            self.artifacts.path = PathBuf::from(path);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.to_ascii_lowercase();
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            self.logging.format = format.parse()?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel.max_workers == 0 {
            return Err(Error::InvalidConfig(
                "parallel.max_workers must be at least 1".to_string(),
            ));
        }
        if !LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "log level must be one of {} (got {})",
                LOG_LEVELS.join(", "),
                self.logging.level
            )));
        }
        // Range checks for the retry section live in the policy builder.
        self.retry_policy().map(|_| ())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::from_config(&self.retry)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("{} has an invalid value: {}", name, value)))
}
