//! Connector configuration.
//!
//! Resolved in three steps: an optional YAML file, then `DSC_*`
//! environment overrides, then validation. A configuration that fails
//! validation never reaches a manager.
//!
//! Environment variables:
//! - `DSC_PARTICIPANT_ID`, `DSC_WORKER_ID`
//! - `DSC_NEGOTIATION_<KEY>` and `DSC_TRANSFER_<KEY>`, where `<KEY>` is a
//!   [`ManagerConfig`] field in upper case, e.g.
//!   `DSC_TRANSFER_BATCH_SIZE=10`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use dsc_core::generate_id;
use serde::{Deserialize, Serialize};

/// Participant id used when none is configured.
pub const DEFAULT_PARTICIPANT_ID: &str = "dsc-connector";

/// Tuning of one state-machine manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Entities leased per state per tick.
    pub batch_size: usize,
    /// Pause after a tick that found no work.
    pub iteration_wait_millis: u64,
    /// Attempts per outbound step before the entity fails.
    pub send_retry_limit: u32,
    /// First backoff delay between attempts; doubles per attempt.
    pub send_retry_base_delay_millis: u64,
    /// How long a worker owns a leased entity.
    pub lease_duration_millis: i64,
    /// Attempts per command before it is dropped.
    pub command_retry_limit: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            batch_size: dsc_state::DEFAULT_BATCH_SIZE,
            iteration_wait_millis: dsc_state::DEFAULT_ITERATION_WAIT_MILLIS,
            send_retry_limit: dsc_transfer::DEFAULT_SEND_RETRY_LIMIT,
            send_retry_base_delay_millis: dsc_transfer::DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS,
            lease_duration_millis: dsc_state::DEFAULT_LEASE_DURATION_MILLIS,
            command_retry_limit: dsc_state::DEFAULT_COMMAND_RETRY_LIMIT,
        }
    }
}

impl ManagerConfig {
    fn apply_env(&mut self, prefix: &str, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let var = |key: &str| format!("{prefix}_{key}");
        if let Some(v) = parse_var(lookup, &var("BATCH_SIZE"))? {
            self.batch_size = v;
        }
        if let Some(v) = parse_var(lookup, &var("ITERATION_WAIT_MILLIS"))? {
            self.iteration_wait_millis = v;
        }
        if let Some(v) = parse_var(lookup, &var("SEND_RETRY_LIMIT"))? {
            self.send_retry_limit = v;
        }
        if let Some(v) = parse_var(lookup, &var("SEND_RETRY_BASE_DELAY_MILLIS"))? {
            self.send_retry_base_delay_millis = v;
        }
        if let Some(v) = parse_var(lookup, &var("LEASE_DURATION_MILLIS"))? {
            self.lease_duration_millis = v;
        }
        if let Some(v) = parse_var(lookup, &var("COMMAND_RETRY_LIMIT"))? {
            self.command_retry_limit = v;
        }
        Ok(())
    }

    fn validate(&self, section: &'static str) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                field: format!("{section}.batch_size"),
                reason: "must be greater than 0".into(),
            });
        }
        if self.lease_duration_millis <= 0 {
            return Err(ConfigError::Invalid {
                field: format!("{section}.lease_duration_millis"),
                reason: "must be greater than 0".into(),
            });
        }
        if self.send_retry_limit == 0 {
            return Err(ConfigError::Invalid {
                field: format!("{section}.send_retry_limit"),
                reason: "must allow at least one attempt".into(),
            });
        }
        Ok(())
    }
}

/// Configuration of one connector process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectorConfig {
    /// Identity of this connector in negotiations.
    pub participant_id: String,
    /// Lease holder identity of this process.
    pub worker_id: String,
    /// Contract negotiation managers.
    pub negotiation: ManagerConfig,
    /// Transfer process managers.
    pub transfer: ManagerConfig,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            participant_id: DEFAULT_PARTICIPANT_ID.to_string(),
            worker_id: generate_id(),
            negotiation: ManagerConfig::default(),
            transfer: ManagerConfig::default(),
        }
    }
}

impl ConnectorConfig {
    /// Resolve the configuration from `path` (if any) and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |var| std::env::var(var).ok())
    }

    /// Resolve the configuration from `path` (if any) and the variables
    /// `lookup` returns.
    pub fn load_with(path: Option<&Path>, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(&lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse the YAML file at `path`. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse a YAML document. Absent keys keep their defaults; an empty
    /// document is the default configuration.
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    fn apply_env(&mut self, lookup: &impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(participant_id) = lookup("DSC_PARTICIPANT_ID") {
            self.participant_id = participant_id;
        }
        if let Some(worker_id) = lookup("DSC_WORKER_ID") {
            self.worker_id = worker_id;
        }
        self.negotiation.apply_env("DSC_NEGOTIATION", lookup)?;
        self.transfer.apply_env("DSC_TRANSFER", lookup)
    }

    /// Check every value a manager relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.participant_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "participant_id".into(),
                reason: "must not be empty".into(),
            });
        }
        if self.worker_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "worker_id".into(),
                reason: "must not be empty".into(),
            });
        }
        self.negotiation.validate("negotiation")?;
        self.transfer.validate("transfer")
    }

    /// The configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Result<Option<T>, ConfigError> {
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value: raw,
        })
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: String, value: String },
    #[error("invalid {field}: {reason}")]
    Invalid { field: String, reason: String },
}
