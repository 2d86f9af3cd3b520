//! Publisher configuration.
//!
//! Sources, lowest to highest precedence: built-in defaults, a JSON file,
//! `PUBLISHER_*` environment variables. The binary layers CLI flags on top.

use crate::error::{PublishError, PublishResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default overall drain bound, in seconds.
pub const DEFAULT_TIMEOUT_SECS: f64 = 60.0;

/// Default number of envelopes per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default per-batch confirmation bound, in seconds.
pub const DEFAULT_BATCH_CONFIRM_TIMEOUT_SECS: f64 = 50.0;

/// Default retry round cap.
pub const DEFAULT_MAX_ROUNDS: u32 = 10;

/// Default wire content type.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// How a publish round waits for broker confirmations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmStrategy {
    /// Chunks of `batch_size`, each waited on before the next is sent.
    #[default]
    Batched,
    /// Every envelope is its own batch.
    PerMessage,
    /// Transmit everything, wait only for the final drain.
    Streaming,
}

impl ConfirmStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmStrategy::Batched => "batched",
            ConfirmStrategy::PerMessage => "per_message",
            ConfirmStrategy::Streaming => "streaming",
        }
    }
}

impl fmt::Display for ConfirmStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfirmStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "batched" | "batch" => Ok(ConfirmStrategy::Batched),
            "per_message" | "single" => Ok(ConfirmStrategy::PerMessage),
            "streaming" | "async" => Ok(ConfirmStrategy::Streaming),
            other => Err(format!("unknown confirm strategy: {other}")),
        }
    }
}

/// Bounds on re-publishing nacked envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry rounds after the first. `None` retries until
    /// every envelope is acked.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: Option<u32>,
    /// Wall-clock budget shared by all rounds, checked between rounds.
    #[serde(default)]
    pub deadline_secs: Option<f64>,
}

fn default_max_rounds() -> Option<u32> {
    Some(DEFAULT_MAX_ROUNDS)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            deadline_secs: None,
        }
    }
}

impl RetryPolicy {
    /// Retry until everything is acked, with no deadline.
    pub fn unbounded() -> Self {
        Self {
            max_rounds: None,
            deadline_secs: None,
        }
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(secs_to_duration)
    }
}

/// Configuration for [`crate::BatchPublisher`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Bound on draining outstanding confirmations per publish round.
    pub timeout_secs: f64,
    /// Envelopes per batch under the batched strategy.
    pub batch_size: usize,
    /// Bound on waiting for one batch's confirmations.
    pub batch_confirm_timeout_secs: f64,
    pub strategy: ConfirmStrategy,
    /// Mark messages persistent on the wire.
    pub persistent: bool,
    pub content_type: String,
    pub retry: RetryPolicy,
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_confirm_timeout_secs: DEFAULT_BATCH_CONFIRM_TIMEOUT_SECS,
            strategy: ConfirmStrategy::default(),
            persistent: true,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            retry: RetryPolicy::default(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

impl PublisherConfig {
    /// Create a config with default values, then override from environment.
    pub fn new() -> Self {
        let mut config = Self::default();
        config.load_from_env();
        config
    }

    /// Load configuration from a JSON file, then override from environment.
    pub fn load(path: &Path) -> PublishResult<Self> {
        let mut config = Self::load_from_file(path)?;
        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific JSON file. Missing fields default.
    pub fn load_from_file(path: &Path) -> PublishResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PublisherConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Override configuration from `PUBLISHER_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn load_from_env(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("PUBLISHER_TIMEOUT_SECS") {
            match value.parse() {
                Ok(secs) => self.timeout_secs = secs,
                Err(_) => tracing::warn!(value = %value, "Ignoring invalid PUBLISHER_TIMEOUT_SECS"),
            }
        }
        if let Some(value) = lookup("PUBLISHER_BATCH_SIZE") {
            match value.parse() {
                Ok(size) => self.batch_size = size,
                Err(_) => tracing::warn!(value = %value, "Ignoring invalid PUBLISHER_BATCH_SIZE"),
            }
        }
        if let Some(value) = lookup("PUBLISHER_STRATEGY") {
            match value.parse() {
                Ok(strategy) => self.strategy = strategy,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid PUBLISHER_STRATEGY"),
            }
        }
        if let Some(level) = lookup("PUBLISHER_LOG_LEVEL") {
            self.log_level = level;
        }
    }

    /// Reject settings the publisher cannot run with.
    pub fn validate(&self) -> PublishResult<()> {
        if self.batch_size == 0 {
            return Err(PublishError::Config("batch_size must be at least 1".into()));
        }
        check_secs("timeout_secs", self.timeout_secs)?;
        check_secs("batch_confirm_timeout_secs", self.batch_confirm_timeout_secs)?;
        if let Some(deadline) = self.retry.deadline_secs {
            check_secs("retry.deadline_secs", deadline)?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        secs_to_duration(self.timeout_secs)
    }

    pub fn batch_confirm_timeout(&self) -> Duration {
        secs_to_duration(self.batch_confirm_timeout_secs)
    }

    /// Envelopes per chunk for the configured strategy.
    pub fn chunk_size(&self) -> usize {
        match self.strategy {
            ConfirmStrategy::PerMessage => 1,
            ConfirmStrategy::Batched | ConfirmStrategy::Streaming => self.batch_size,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batch_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.batch_confirm_timeout_secs = timeout.as_secs_f64();
        self
    }

    pub fn with_strategy(mut self, strategy: ConfirmStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

fn check_secs(name: &str, secs: f64) -> PublishResult<()> {
    if !secs.is_finite() || secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
        return Err(PublishError::Config(format!(
            "{name} must be a positive number of seconds, got {secs}"
        )));
    }
    Ok(())
}

fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}
