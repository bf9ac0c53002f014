use std::collections::HashMap;
use std::time::Duration;

use backoff::strategy::exponential::Exponential;

use crate::error::{Error, Result};

const DEFAULT_BATCH_SIZE: usize = 5000;
const DEFAULT_BATCH_INTERVAL_MS: u64 = 0;
const DEFAULT_MAX_RETRIES: u16 = 0;
const DEFAULT_MAX_COMMIT_ATTEMPTS: u16 = 3;
const DEFAULT_RECOVER_AND_ROLLBACK: bool = true;
const DEFAULT_TRANSACTION_PER_CONNECTION: bool = false;
const DEFAULT_MAX_RETRY_ATTEMPTS: u16 = 3;
const DEFAULT_INITIAL_RETRY_INTERVAL_MS: u32 = 100;
const DEFAULT_MAX_RETRY_INTERVAL_MS: u32 = 5000;
const DEFAULT_RETRY_FACTOR: f64 = 2.0;
const DEFAULT_RETRY_JITTER: f64 = 0.0;

const ENV_BATCH_SIZE: &str = "NUMAFLOW_XA_BATCH_SIZE";
const ENV_BATCH_INTERVAL_MS: &str = "NUMAFLOW_XA_BATCH_INTERVAL_MS";
const ENV_MAX_RETRIES: &str = "NUMAFLOW_XA_MAX_RETRIES";
const ENV_MAX_COMMIT_ATTEMPTS: &str = "NUMAFLOW_XA_MAX_COMMIT_ATTEMPTS";
const ENV_RECOVER_AND_ROLLBACK: &str = "NUMAFLOW_XA_RECOVER_AND_ROLLBACK";
const ENV_TRANSACTION_TIMEOUT_SECS: &str = "NUMAFLOW_XA_TRANSACTION_TIMEOUT_SECS";
const ENV_TRANSACTION_PER_CONNECTION: &str = "NUMAFLOW_XA_TRANSACTION_PER_CONNECTION";
const ENV_RETRY_MAX_ATTEMPTS: &str = "NUMAFLOW_XA_RETRY_MAX_ATTEMPTS";
const ENV_RETRY_INITIAL_INTERVAL_MS: &str = "NUMAFLOW_XA_RETRY_INITIAL_INTERVAL_MS";
const ENV_RETRY_MAX_INTERVAL_MS: &str = "NUMAFLOW_XA_RETRY_MAX_INTERVAL_MS";
const ENV_RETRY_FACTOR: &str = "NUMAFLOW_XA_RETRY_FACTOR";
const ENV_RETRY_JITTER: &str = "NUMAFLOW_XA_RETRY_JITTER";

/// How rows are batched before they are executed in the open branch.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    /// Flush once this many rows are buffered.
    pub batch_size: usize,
    /// Flush buffered rows at least this often. Zero disables the timer.
    pub batch_interval: Duration,
    /// Re-executions of a failed batch. Has to stay 0: re-executing inside an open branch may
    /// duplicate rows.
    pub max_retries: u16,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval: Duration::from_millis(DEFAULT_BATCH_INTERVAL_MS),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExactlyOnceConfig {
    /// Total commit attempts (first try included) before a commit is escalated.
    pub max_commit_attempts: u16,
    /// On restore, roll back prepared branches of this subtask that no restored state knows.
    pub recover_and_rollback: bool,
    /// Passed to the backend on begin; `None` keeps the backend default.
    pub transaction_timeout: Option<Duration>,
    /// Use a separate physical connection per branch (required by some backends, e.g. PostgreSQL
    /// cannot start a new branch on a connection with a prepared one pending).
    pub transaction_per_connection: bool,
}

impl Default for ExactlyOnceConfig {
    fn default() -> Self {
        Self {
            max_commit_attempts: DEFAULT_MAX_COMMIT_ATTEMPTS,
            recover_and_rollback: DEFAULT_RECOVER_AND_ROLLBACK,
            transaction_timeout: None,
            transaction_per_connection: DEFAULT_TRANSACTION_PER_CONNECTION,
        }
    }
}

/// Backoff for begin/prepare/commit/rollback retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retry_attempts: u16,
    pub initial_retry_interval_in_ms: u32,
    pub max_retry_interval_in_ms: u32,
    pub retry_factor: f64,
    pub retry_jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            initial_retry_interval_in_ms: DEFAULT_INITIAL_RETRY_INTERVAL_MS,
            max_retry_interval_in_ms: DEFAULT_MAX_RETRY_INTERVAL_MS,
            retry_factor: DEFAULT_RETRY_FACTOR,
            retry_jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl RetryConfig {
    /// Backoff allowing `retries` retries after the first attempt.
    pub(crate) fn backoff(&self, retries: u16) -> Exponential {
        Exponential::from_millis(
            u64::from(self.initial_retry_interval_in_ms),
            u64::from(self.max_retry_interval_in_ms),
            self.retry_factor,
        )
        .jitter(self.retry_jitter)
        .max_attempts(retries)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub execution: ExecutionConfig,
    pub exactly_once: ExactlyOnceConfig,
    pub retry: RetryConfig,
}

impl Settings {
    /// Load from environment variables, falling back to defaults for the ones not set.
    pub fn load(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _)| key.starts_with("NUMAFLOW_XA_"))
            .collect();

        let mut settings = Settings::default();

        if let Some(v) = parse_var(&env_vars, ENV_BATCH_SIZE)? {
            settings.execution.batch_size = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_BATCH_INTERVAL_MS)? {
            settings.execution.batch_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse_var(&env_vars, ENV_MAX_RETRIES)? {
            settings.execution.max_retries = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_MAX_COMMIT_ATTEMPTS)? {
            settings.exactly_once.max_commit_attempts = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_RECOVER_AND_ROLLBACK)? {
            settings.exactly_once.recover_and_rollback = v;
        }
        if let Some(v) = parse_var::<u64>(&env_vars, ENV_TRANSACTION_TIMEOUT_SECS)? {
            settings.exactly_once.transaction_timeout = (v > 0).then(|| Duration::from_secs(v));
        }
        if let Some(v) = parse_var(&env_vars, ENV_TRANSACTION_PER_CONNECTION)? {
            settings.exactly_once.transaction_per_connection = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_RETRY_MAX_ATTEMPTS)? {
            settings.retry.max_retry_attempts = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_RETRY_INITIAL_INTERVAL_MS)? {
            settings.retry.initial_retry_interval_in_ms = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_RETRY_MAX_INTERVAL_MS)? {
            settings.retry.max_retry_interval_in_ms = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_RETRY_FACTOR)? {
            settings.retry.retry_factor = v;
        }
        if let Some(v) = parse_var(&env_vars, ENV_RETRY_JITTER)? {
            settings.retry.retry_jitter = v;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.execution.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".to_string()));
        }
        if self.execution.max_retries != 0 {
            return Err(Error::Config(
                "the exactly-once sink requires max_retries equal to 0, otherwise it could cause duplicates"
                    .to_string(),
            ));
        }
        if self.exactly_once.max_commit_attempts == 0 {
            return Err(Error::Config(
                "max_commit_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.retry_factor < 1.0 {
            return Err(Error::Config(format!(
                "retry_factor must be >= 1.0, got {}",
                self.retry.retry_factor
            )));
        }
        if !(0.0..=1.0).contains(&self.retry.retry_jitter) {
            return Err(Error::Config(format!(
                "retry_jitter must be within [0.0, 1.0], got {}",
                self.retry.retry_jitter
            )));
        }
        if self.retry.initial_retry_interval_in_ms > self.retry.max_retry_interval_in_ms {
            return Err(Error::Config(
                "initial retry interval cannot exceed the max retry interval".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(env_vars: &HashMap<String, String>, var: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_vars
        .get(var)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| Error::Config(format!("Invalid value {raw:?} for {var}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.execution.batch_size, 5000);
        assert_eq!(settings.execution.batch_interval, Duration::ZERO);
        assert_eq!(settings.exactly_once.max_commit_attempts, 3);
        assert!(settings.exactly_once.recover_and_rollback);
        assert!(!settings.exactly_once.transaction_per_connection);
        assert_eq!(settings.exactly_once.transaction_timeout, None);
    }

    #[test]
    fn load_from_env() {
        let settings = Settings::load([
            (ENV_BATCH_SIZE, "10"),
            (ENV_BATCH_INTERVAL_MS, "250"),
            (ENV_MAX_COMMIT_ATTEMPTS, "5"),
            (ENV_RECOVER_AND_ROLLBACK, "false"),
            (ENV_TRANSACTION_TIMEOUT_SECS, "30"),
            (ENV_TRANSACTION_PER_CONNECTION, "true"),
            (ENV_RETRY_MAX_ATTEMPTS, "7"),
            (ENV_RETRY_JITTER, "0.5"),
            ("UNRELATED_VAR", "ignored"),
        ])
        .unwrap();

        assert_eq!(settings.execution.batch_size, 10);
        assert_eq!(settings.execution.batch_interval, Duration::from_millis(250));
        assert_eq!(settings.exactly_once.max_commit_attempts, 5);
        assert!(!settings.exactly_once.recover_and_rollback);
        assert_eq!(
            settings.exactly_once.transaction_timeout,
            Some(Duration::from_secs(30))
        );
        assert!(settings.exactly_once.transaction_per_connection);
        assert_eq!(settings.retry.max_retry_attempts, 7);
        assert_eq!(settings.retry.retry_jitter, 0.5);
    }

    #[test]
    fn load_rejects_garbage() {
        let err = Settings::load([(ENV_BATCH_SIZE, "lots")]).unwrap_err();
        assert!(err.to_string().contains(ENV_BATCH_SIZE));
    }

    #[test]
    fn execution_retries_are_rejected() {
        let err = Settings::load([(ENV_MAX_RETRIES, "3")]).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("duplicates")));
    }

    #[test]
    fn validate_bounds() {
        let mut settings = Settings::default();
        settings.execution.batch_size = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.exactly_once.max_commit_attempts = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.retry.retry_factor = 0.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.retry.initial_retry_interval_in_ms = 10_000;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn backoff_honours_retry_budget() {
        let retry = RetryConfig {
            initial_retry_interval_in_ms: 10,
            max_retry_interval_in_ms: 30,
            ..Default::default()
        };
        let delays: Vec<_> = retry.backoff(4).collect();
        assert_eq!(
            delays,
            [10, 20, 30, 30].map(Duration::from_millis).to_vec()
        );
    }
}
