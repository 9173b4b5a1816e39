//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! malformed. The database URL is wrapped in secrecy::SecretString to keep
//! credentials out of logs.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::worker::ListenerConfig;
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub queue_name: String,
    pub reset_duration: Duration,
    pub poll_interval: Duration,
    pub wait: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            queue_name: std::env::var("LEASEQ_QUEUE").unwrap_or_else(|_| "default".to_string()),
            reset_duration: millis_var("LEASEQ_RESET_DURATION_MS", 60_000)?,
            poll_interval: millis_var("LEASEQ_POLL_INTERVAL_MS", 200)?,
            wait: millis_var("LEASEQ_WAIT_MS", 3_000)?,
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Listener settings derived from this configuration.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            poll_interval: self.poll_interval,
            wait: self.wait,
            ..ListenerConfig::default()
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn millis_var(name: &str, default_ms: u64) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| Error::Config(format!("{name} must be a number of milliseconds: {e}"))),
        Err(_) => Ok(Duration::from_millis(default_ms)),
    }
}
