//! Environment configuration shared by both binaries.

use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::drain::{DrainConfig, RetryPolicy};
use crate::error::ConfigError;
use crate::types::PartitionId;

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Relay configuration.
///
/// Policy defaults (five attempts, 5s to 20s backoff, 5s ingress and 10s
/// drain timeouts) apply when a variable is unset. The broker URL and
/// the downstream URL have no default.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ingress HTTP bind address.
    pub listen_addr: SocketAddr,

    /// `redis://`, `postgres://` or `memory://`.
    pub broker_url: String,

    /// Topic / stream name.
    pub stream: String,

    /// Number of partitions in the log.
    pub partitions: u32,

    pub consumer_group: String,

    /// Bound on a single broker round trip.
    pub broker_timeout: Duration,

    /// Transport-level attempts for one append.
    pub append_attempts: u32,

    pub downstream_url: String,

    /// Token the provider must echo during the subscription handshake.
    pub verify_token: Option<String>,

    /// Secret for `X-Hub-Signature-256` checks. Unset disables the check.
    pub app_secret: Option<Vec<u8>>,

    pub ingress_timeout: Duration,
    pub drain_timeout: Duration,

    /// Delivery attempts per queued record before it is discarded.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub retry_jitter: Duration,

    /// Idle wait after a fetch finds nothing.
    pub poll_interval: Duration,

    /// Wait after a fetch, commit or dead-letter write fails.
    pub infra_backoff: Duration,

    /// Partitions this drain process owns. `None` means all of them.
    pub drain_partitions: Option<Vec<PartitionId>>,

    /// Park discarded records in the dead-letter store.
    pub dead_letter: bool,

    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from `RELAY_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let config = Config {
            listen_addr: parse_or(&lookup, "RELAY_LISTEN_ADDR", SocketAddr::from(([0, 0, 0, 0], 8080)))?,
            broker_url: required(&lookup, "RELAY_BROKER_URL")?,
            stream: lookup("RELAY_STREAM").unwrap_or_else(|| "webhook_events".to_string()),
            partitions: parse_or(&lookup, "RELAY_PARTITIONS", 8)?,
            consumer_group: lookup("RELAY_CONSUMER_GROUP").unwrap_or_else(|| "webhook-relay".to_string()),
            broker_timeout: millis_or(&lookup, "RELAY_BROKER_TIMEOUT_MS", 5_000)?,
            append_attempts: parse_or(&lookup, "RELAY_APPEND_ATTEMPTS", 3)?,
            downstream_url: required(&lookup, "RELAY_DOWNSTREAM_URL")?,
            verify_token: lookup("RELAY_VERIFY_TOKEN"),
            app_secret: lookup("RELAY_APP_SECRET").map(String::into_bytes),
            ingress_timeout: millis_or(&lookup, "RELAY_INGRESS_TIMEOUT_MS", 5_000)?,
            drain_timeout: millis_or(&lookup, "RELAY_DRAIN_TIMEOUT_MS", 10_000)?,
            max_retries: parse_or(&lookup, "RELAY_MAX_RETRIES", 5)?,
            retry_backoff: millis_or(&lookup, "RELAY_RETRY_BACKOFF_MS", 5_000)?,
            retry_backoff_max: millis_or(&lookup, "RELAY_RETRY_BACKOFF_MAX_MS", 20_000)?,
            retry_jitter: millis_or(&lookup, "RELAY_RETRY_JITTER_MS", 0)?,
            poll_interval: millis_or(&lookup, "RELAY_POLL_INTERVAL_MS", 500)?,
            infra_backoff: millis_or(&lookup, "RELAY_INFRA_BACKOFF_MS", 1_000)?,
            drain_partitions: match lookup("RELAY_DRAIN_PARTITIONS") {
                Some(list) => Some(parse_partition_list(&list)?),
                None => None,
            },
            dead_letter: parse_or(&lookup, "RELAY_DEAD_LETTER", false)?,
            log_level: lookup("RELAY_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format: match lookup("RELAY_LOG_FORMAT") {
                None => LogFormat::Pretty,
                Some(format) => match format.to_lowercase().as_str() {
                    "json" => LogFormat::Json,
                    "pretty" => LogFormat::Pretty,
                    other => {
                        return Err(ConfigError(format!(
                            "invalid RELAY_LOG_FORMAT: {other} (expected 'json' or 'pretty')"
                        )))
                    }
                },
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(ConfigError("RELAY_PARTITIONS must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError("RELAY_MAX_RETRIES must be at least 1".into()));
        }
        if self.append_attempts == 0 {
            return Err(ConfigError("RELAY_APPEND_ATTEMPTS must be at least 1".into()));
        }
        if self.broker_timeout.is_zero() {
            return Err(ConfigError("RELAY_BROKER_TIMEOUT_MS must be non-zero".into()));
        }
        if self.ingress_timeout.is_zero() || self.drain_timeout.is_zero() {
            return Err(ConfigError("delivery timeouts must be non-zero".into()));
        }
        if self.retry_backoff_max < self.retry_backoff {
            return Err(ConfigError(
                "RELAY_RETRY_BACKOFF_MAX_MS must not be below RELAY_RETRY_BACKOFF_MS".into(),
            ));
        }
        if let Some(owned) = &self.drain_partitions {
            if let Some(bad) = owned.iter().find(|p| p.0 >= self.partitions) {
                return Err(ConfigError(format!(
                    "RELAY_DRAIN_PARTITIONS names partition {bad}, log has {}",
                    self.partitions
                )));
            }
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: self.retry_backoff,
            backoff_max: self.retry_backoff_max,
            jitter: self.retry_jitter,
        }
    }

    pub fn drain_config(&self) -> DrainConfig {
        DrainConfig {
            retry: self.retry_policy(),
            delivery_timeout: self.drain_timeout,
            poll_interval: self.poll_interval,
            infra_backoff: self.infra_backoff,
            partitions: self.drain_partitions.clone(),
            dead_letter: self.dead_letter,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::from_lookup(|name| match name {
            "RELAY_BROKER_URL" => Some("memory://".to_string()),
            "RELAY_DOWNSTREAM_URL" => Some("http://127.0.0.1:9/ingest".to_string()),
            _ => None,
        })
        .expect("test config")
    }
}

fn required<F>(lookup: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).ok_or_else(|| ConfigError(format!("{name} is required")))
}

fn parse_or<F, T>(lookup: &F, name: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError(format!("invalid {name}: {e}"))),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, name: &str, default_ms: u64) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, name, default_ms).map(Duration::from_millis)
}

fn parse_partition_list(list: &str) -> Result<Vec<PartitionId>> {
    let mut partitions = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let id = item
            .parse::<u32>()
            .map_err(|e| ConfigError(format!("invalid RELAY_DRAIN_PARTITIONS entry {item:?}: {e}")))?;
        let id = PartitionId(id);
        if !partitions.contains(&id) {
            partitions.push(id);
        }
    }
    if partitions.is_empty() {
        return Err(ConfigError("RELAY_DRAIN_PARTITIONS is empty".into()));
    }
    partitions.sort();
    Ok(partitions)
}
