//! Environment-driven configuration.
//!
//! Every setting except `DATABASE_URL` has a default suitable for local
//! development. Use [`Config::from_lookup`] to load from something other than
//! the process environment (tests, config maps).

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    /// Upper bound on waiting for a row lock inside a transaction.
    pub lock_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub concurrency: usize,
    /// Key prefix for queue storage.
    pub namespace: String,
    pub lease: Duration,
    pub task_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailConfig {
    pub sender_name: String,
    pub sender_address: String,
    pub verify_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub email: EmailConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);

        Ok(Self {
            database: DatabaseConfig {
                url: env.required("DATABASE_URL")?,
                max_connections: env.parse_or("DB_MAX_CONNECTIONS", 10)?,
                lock_timeout: Duration::from_millis(env.parse_or("DB_LOCK_TIMEOUT_MS", 5_000)?),
            },
            worker: WorkerConfig {
                redis_url: env.string_or("REDIS_URL", "redis://127.0.0.1:6379"),
                concurrency: env.parse_or("WORKER_CONCURRENCY", 4)?,
                namespace: env.string_or("TASK_NAMESPACE", "simplebank"),
                lease: Duration::from_secs(env.positive_or("TASK_LEASE_SECS", 60)?),
                task_timeout: Duration::from_secs(env.parse_or("TASK_TIMEOUT_SECS", 30)?),
            },
            email: EmailConfig {
                sender_name: env.string_or("EMAIL_SENDER_NAME", "Simple Bank"),
                sender_address: env.string_or("EMAIL_SENDER_ADDRESS", "noreply@simplebank.local"),
                verify_url: env.string_or(
                    "VERIFY_EMAIL_URL",
                    "http://localhost:8080/v1/verify_email",
                ),
            },
        })
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.trim().is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn string_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn positive_or(&self, key: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.parse_or(key, default)? {
            0 => Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
                reason: "must be greater than zero".to_string(),
            }),
            n => Ok(n),
        }
    }

    fn parse_or<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }
}
