//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. Connection strings
//! are wrapped in `secrecy::SecretString` to keep credentials out of logs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::consumer::{AckMode, ConsumerConfig};
use crate::error::{Error, Result};
use crate::outbox::RelayConfig;
use crate::tracker::DeliveryMode;

#[derive(Debug)]
pub struct Config {
    /// The service's own database. Not needed by the schema gate.
    pub database_url: Option<SecretString>,
    /// Postgres instance hosting the pgmq queues. Defaults to `database_url`.
    pub broker_url: Option<SecretString>,
    /// Remote schema gate. When unset, producers validate in-process.
    pub schema_gate_url: Option<String>,
    pub schema_dir: PathBuf,
    /// Bind address; each service has its own default.
    pub http_addr: Option<String>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub consumer: ConsumerConfig,
    pub relay: RelayConfig,
    pub delivery_mode: DeliveryMode,
    /// Seed for the process-wide random source. Random when unset.
    pub rng_seed: Option<u64>,
    /// Upper bound on HTTP drain time after a shutdown signal.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let database_url = optional_var("DATABASE_URL");
        let broker_url = optional_var("BROKER_URL").or_else(|| database_url.clone());

        let ack_mode = match optional_var("ACK_MODE").as_deref() {
            None => AckMode::default(),
            Some(raw) => raw.parse()?,
        };
        let ack_mode = match ack_mode {
            AckMode::AfterCommit { .. } => AckMode::AfterCommit {
                max_attempts: parse_var("MAX_DELIVERY_ATTEMPTS", 5)?,
            },
            auto => auto,
        };

        let poll_interval = Duration::from_millis(parse_var("POLL_INTERVAL_MS", 1000)?);

        Ok(Self {
            database_url: database_url.map(SecretString::from),
            broker_url: broker_url.map(SecretString::from),
            schema_gate_url: optional_var("SCHEMA_GATE_URL"),
            schema_dir: PathBuf::from(
                optional_var("SCHEMA_DIR").unwrap_or_else(|| "schemas".to_string()),
            ),
            http_addr: optional_var("HTTP_ADDR"),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            consumer: ConsumerConfig {
                ack_mode,
                visibility_timeout: Duration::from_secs(parse_var("VISIBILITY_TIMEOUT_SECS", 30)?),
                poll_interval,
            },
            relay: RelayConfig {
                batch_size: parse_var("OUTBOX_BATCH_SIZE", 100)?,
                poll_interval,
            },
            delivery_mode: match optional_var("DELIVERY_MODE").as_deref() {
                None => DeliveryMode::default(),
                Some(raw) => raw.parse()?,
            },
            rng_seed: optional_var("RNG_SEED").map(|s| parse_value("RNG_SEED", &s)).transpose()?,
            shutdown_grace: Duration::from_secs(parse_var("SHUTDOWN_GRACE_SECS", 10)?),
        })
    }

    /// The service database URL, or a config error naming the variable.
    pub fn database_url(&self) -> Result<&SecretString> {
        self.database_url
            .as_ref()
            .ok_or_else(|| Error::Config(required_message("DATABASE_URL")))
    }

    pub fn broker_url(&self) -> Result<&SecretString> {
        self.broker_url
            .as_ref()
            .ok_or_else(|| Error::Config(required_message("BROKER_URL (or DATABASE_URL)")))
    }
}

fn required_message(name: &str) -> String {
    format!("required environment variable {name} is not set")
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match optional_var(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid value for {name} ({raw}): {e}")))
}
