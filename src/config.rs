//! # Configuration
//!
//! [`DatabaseConfig`] gathers the writer, runner and reader settings. Every
//! field has a default; [`DatabaseConfig::from_env`] overlays environment
//! variables on top of those defaults:
//!
//! | Variable                             | Field                          |
//! |--------------------------------------|--------------------------------|
//! | `SPITEDOCS_BATCH_TIMEOUT_MS`         | `writer.batch_timeout`         |
//! | `SPITEDOCS_BATCH_MAX_SIZE`           | `writer.batch_max_size`        |
//! | `SPITEDOCS_BULK_BATCH_SIZE`          | `runner.batch_size`            |
//! | `SPITEDOCS_READER_THREADS`           | `reader_threads`               |
//! | `SPITEDOCS_OPERATION_TIMEOUT_SECS`   | `operation_timeout` (0 = none) |
//! | `SPITEDOCS_OPERATION_RETENTION_SECS` | `operation_retention`          |

use std::str::FromStr;
use std::thread::available_parallelism;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::operations::DEFAULT_OPERATION_RETENTION;
use crate::runner::RunnerConfig;
use crate::writer::WriterConfig;

/// Minimum number of reader threads.
pub const MIN_READ_THREADS: usize = 1;

/// Maximum number of reader threads.
pub const MAX_READ_THREADS: usize = 16;

const ENV_BATCH_TIMEOUT_MS: &str = "SPITEDOCS_BATCH_TIMEOUT_MS";
const ENV_BATCH_MAX_SIZE: &str = "SPITEDOCS_BATCH_MAX_SIZE";
const ENV_BULK_BATCH_SIZE: &str = "SPITEDOCS_BULK_BATCH_SIZE";
const ENV_READER_THREADS: &str = "SPITEDOCS_READER_THREADS";
const ENV_OPERATION_TIMEOUT_SECS: &str = "SPITEDOCS_OPERATION_TIMEOUT_SECS";
const ENV_OPERATION_RETENTION_SECS: &str = "SPITEDOCS_OPERATION_RETENTION_SECS";

/// Configuration for a [`crate::DocumentDatabase`].
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub writer: WriterConfig,
    pub runner: RunnerConfig,
    /// Reader pool size.
    pub reader_threads: usize,
    /// Inactivity timeout for tracked bulk operations. Progress postpones it.
    pub operation_timeout: Option<Duration>,
    /// How long finished tracked operations stay queryable.
    pub operation_retention: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let reader_threads = available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_READ_THREADS)
            .clamp(MIN_READ_THREADS, MAX_READ_THREADS);

        Self {
            writer: WriterConfig::default(),
            runner: RunnerConfig::default(),
            reader_threads,
            operation_timeout: None,
            operation_retention: DEFAULT_OPERATION_RETENTION,
        }
    }
}

impl DatabaseConfig {
    /// Loads the defaults, overridden by `SPITEDOCS_*` environment variables.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfiguration` if a variable is set but malformed or out
    /// of range.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, ENV_BATCH_TIMEOUT_MS)? {
            config.writer.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<usize>(&lookup, ENV_BATCH_MAX_SIZE)? {
            config.writer.batch_max_size = size;
        }
        if let Some(size) = parse_var::<usize>(&lookup, ENV_BULK_BATCH_SIZE)? {
            config.runner.batch_size = size;
        }
        if let Some(threads) = parse_var::<usize>(&lookup, ENV_READER_THREADS)? {
            config.reader_threads = threads;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_OPERATION_TIMEOUT_SECS)? {
            config.operation_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_OPERATION_RETENTION_SECS)? {
            config.operation_retention = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.writer.batch_max_size == 0 {
            return Err(Error::InvalidConfiguration(
                "writer batch_max_size must be positive".into(),
            ));
        }
        if self.runner.batch_size == 0 {
            return Err(Error::InvalidConfiguration(
                "runner batch_size must be positive".into(),
            ));
        }
        if self.operation_retention.is_zero() {
            return Err(Error::InvalidConfiguration(
                "operation_retention must be positive".into(),
            ));
        }
        if !(MIN_READ_THREADS..=MAX_READ_THREADS).contains(&self.reader_threads) {
            return Err(Error::InvalidConfiguration(format!(
                "reader_threads must be between {MIN_READ_THREADS} and {MAX_READ_THREADS}, got {}",
                self.reader_threads
            )));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>> {
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            Error::InvalidConfiguration(format!("{name} has invalid value '{raw}'"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.runner.batch_size, 1024);
        assert_eq!(config.writer.batch_timeout, Duration::from_millis(10));
        assert!(config.operation_timeout.is_none());
        assert_eq!(config.operation_retention, Duration::from_secs(900));
        assert!(config.reader_threads >= MIN_READ_THREADS);
    }

    #[test]
    fn test_overrides() {
        let config = DatabaseConfig::from_lookup(lookup(&[
            (ENV_BATCH_TIMEOUT_MS, "25"),
            (ENV_BULK_BATCH_SIZE, "64"),
            (ENV_READER_THREADS, "2"),
            (ENV_OPERATION_TIMEOUT_SECS, "30"),
            (ENV_OPERATION_RETENTION_SECS, "120"),
        ]))
        .unwrap();

        assert_eq!(config.writer.batch_timeout, Duration::from_millis(25));
        assert_eq!(config.runner.batch_size, 64);
        assert_eq!(config.reader_threads, 2);
        assert_eq!(config.operation_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.operation_retention, Duration::from_secs(120));
    }

    #[test]
    fn test_malformed_value_rejected() {
        let err = DatabaseConfig::from_lookup(lookup(&[(ENV_BATCH_MAX_SIZE, "lots")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(msg) if msg.contains(ENV_BATCH_MAX_SIZE)));
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(DatabaseConfig::from_lookup(lookup(&[(ENV_BULK_BATCH_SIZE, "0")])).is_err());
        assert!(DatabaseConfig::from_lookup(lookup(&[(ENV_READER_THREADS, "99")])).is_err());
        assert!(DatabaseConfig::from_lookup(lookup(&[(ENV_OPERATION_RETENTION_SECS, "0")])).is_err());
    }
}
