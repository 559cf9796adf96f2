//! Run configuration: defaults, environment overrides, range checks.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::inserter::TransactionTimeouts;
use crate::retry::RetryPolicy;

pub const MAX_BATCH_SIZE: usize = 5_000;

const ENV_BATCH_SIZE: &str = "PAGEVIEW_IMPORT_BATCH_SIZE";
const ENV_LOG_DIR: &str = "PAGEVIEW_IMPORT_LOG_DIR";
const ENV_MAX_RETRIES: &str = "PAGEVIEW_IMPORT_MAX_RETRIES";
const ENV_PROGRESS_EVERY: &str = "PAGEVIEW_IMPORT_PROGRESS_EVERY";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch size must be between 1 and {max}, got {0}", max = MAX_BATCH_SIZE)]
    BatchSize(usize),
    #[error("progress interval must be at least 1 batch")]
    ProgressEvery,
    #[error("unknown character set: {0}")]
    Charset(String),
    #[error("{var}={value:?} is not a valid value")]
    Env { var: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportConfig {
    /// Validated records buffered before a flush.
    pub batch_size: usize,
    /// Log progress every N batches.
    pub progress_every: u64,
    pub retry: RetryPolicy,
    pub timeouts: TransactionTimeouts,
    /// Directory for run logs; created when missing.
    pub log_dir: PathBuf,
    /// Validation errors shown in the console summary.
    pub error_preview: usize,
    /// Cap on per-row and per-batch errors kept in memory. The run log
    /// always has every one.
    pub max_recorded_errors: usize,
    /// Only rows whose `datapoint` column equals this are imported.
    pub datapoint_filter: String,
    /// Input charset label (WHATWG names, e.g. `utf-8`, `windows-1252`).
    pub charset: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            progress_every: 10,
            retry: RetryPolicy::default(),
            timeouts: TransactionTimeouts::default(),
            log_dir: PathBuf::from("logs"),
            error_preview: 10,
            max_recorded_errors: 1_000,
            datapoint_filter: "pageview".to_string(),
            charset: "utf-8".to_string(),
        }
    }
}

impl ImportConfig {
    /// Defaults overlaid with `PAGEVIEW_IMPORT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|var| std::env::var(var).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_BATCH_SIZE) {
            self.batch_size = parse_env(ENV_BATCH_SIZE, v)?;
        }
        if let Some(v) = lookup(ENV_MAX_RETRIES) {
            self.retry.max_retries = parse_env(ENV_MAX_RETRIES, v)?;
        }
        if let Some(v) = lookup(ENV_PROGRESS_EVERY) {
            self.progress_every = parse_env(ENV_PROGRESS_EVERY, v)?;
        }
        if let Some(v) = lookup(ENV_LOG_DIR).filter(|v| !v.trim().is_empty()) {
            self.log_dir = PathBuf::from(v);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConfigError::BatchSize(self.batch_size));
        }
        if self.progress_every == 0 {
            return Err(ConfigError::ProgressEvery);
        }
        self.encoding()?;
        Ok(())
    }

    pub fn encoding(&self) -> Result<&'static encoding_rs::Encoding, ConfigError> {
        encoding_rs::Encoding::for_label(self.charset.trim().as_bytes())
            .ok_or_else(|| ConfigError::Charset(self.charset.clone()))
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Env { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = ImportConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.batch_size, 1_000);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.encoding().unwrap(), encoding_rs::UTF_8);
    }

    #[test]
    fn overrides_apply() {
        let cfg = ImportConfig::default()
            .with_overrides(|var| match var {
                ENV_BATCH_SIZE => Some("250".into()),
                ENV_LOG_DIR => Some("/tmp/import-logs".into()),
                ENV_MAX_RETRIES => Some(" 5 ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cfg.batch_size, 250);
        assert_eq!(cfg.retry.max_retries, 5);
        assert_eq!(cfg.log_dir, PathBuf::from("/tmp/import-logs"));
        assert_eq!(cfg.progress_every, 10);
    }

    #[test]
    fn bad_values_are_rejected() {
        let err = ImportConfig::default()
            .with_overrides(|var| (var == ENV_BATCH_SIZE).then(|| "lots".to_string()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Env {
                var: ENV_BATCH_SIZE,
                value: "lots".into()
            }
        );

        let cfg = ImportConfig {
            batch_size: MAX_BATCH_SIZE + 1,
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::BatchSize(MAX_BATCH_SIZE + 1)));

        let cfg = ImportConfig {
            charset: "klingon".into(),
            ..Default::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Charset("klingon".into())));
    }
}
