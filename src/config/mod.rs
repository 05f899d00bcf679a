//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in `SecretString` to keep
//! credentials out of logs.

pub mod secrets;

use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Longest a blocked `get` sleeps between store polls.
    pub poll_interval: Duration,
    /// Time between reconciliation passes.
    pub maintenance_interval: Duration,
    /// How long finish results are kept.
    pub result_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            poll_interval: Duration::from_millis(nonzero_var("JOBQ_POLL_INTERVAL_MS", 500)?),
            maintenance_interval: Duration::from_secs(nonzero_var(
                "JOBQ_MAINTENANCE_INTERVAL_SECS",
                30,
            )?),
            result_ttl: Duration::from_secs(parsed_var("JOBQ_RESULT_TTL_SECS", 3600)?),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("environment variable {name} is invalid: {raw}"))),
        Err(_) => Ok(default),
    }
}

fn nonzero_var(name: &str, default: u64) -> Result<u64> {
    match parsed_var(name, default)? {
        0 => Err(Error::Config(format!("environment variable {name} must be greater than zero"))),
        value => Ok(value),
    }
}
