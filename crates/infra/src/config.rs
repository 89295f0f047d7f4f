//! Engine configuration.
//!
//! Defaults suit tests and a single-process deployment; `from_env` overrides
//! them from `FACTLINE_*` variables (and `DATABASE_URL`).

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Tunables shared by the dispatcher, projectors, guard and coordinator.
///
/// Retention windows (`idempotency_retention`, `lease_ttl`) are deployment
/// parameters with no universally right value; the defaults are conservative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of log partitions; fixed for the lifetime of a log.
    pub partitions: u32,
    /// Maximum events a projector folds per batch.
    pub batch_size: usize,
    /// How long an idle projector waits for a wake-up before polling the log.
    pub poll_interval: Duration,
    /// Lifetime of an unconfirmed uniqueness reservation.
    pub lease_ttl: Duration,
    /// Lifetime of an idempotency pending marker.
    pub idempotency_pending_ttl: Duration,
    /// How long completed idempotency records are kept.
    pub idempotency_retention: Duration,
    /// Attempts per command before a concurrency conflict is surfaced.
    pub max_command_attempts: u32,
    pub retry_backoff: Duration,
    pub retry_backoff_max: Duration,
    pub database_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            partitions: 4,
            batch_size: 128,
            poll_interval: Duration::from_millis(250),
            lease_ttl: Duration::from_secs(30),
            idempotency_pending_ttl: Duration::from_secs(30),
            idempotency_retention: Duration::from_secs(7 * 24 * 60 * 60),
            max_command_attempts: 3,
            retry_backoff: Duration::from_millis(50),
            retry_backoff_max: Duration::from_secs(5),
            database_url: None,
        }
    }
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (unset keys keep their default).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parse::<u32>(&lookup, "FACTLINE_PARTITIONS")? {
            cfg.partitions = positive("FACTLINE_PARTITIONS", v)?;
        }
        if let Some(v) = parse::<usize>(&lookup, "FACTLINE_BATCH_SIZE")? {
            cfg.batch_size = positive("FACTLINE_BATCH_SIZE", v)?;
        }
        if let Some(v) = parse::<u64>(&lookup, "FACTLINE_POLL_INTERVAL_MS")? {
            cfg.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "FACTLINE_LEASE_TTL_SECS")? {
            cfg.lease_ttl = Duration::from_secs(positive("FACTLINE_LEASE_TTL_SECS", v)?);
        }
        if let Some(v) = parse::<u64>(&lookup, "FACTLINE_IDEMPOTENCY_PENDING_TTL_SECS")? {
            cfg.idempotency_pending_ttl = Duration::from_secs(positive("FACTLINE_IDEMPOTENCY_PENDING_TTL_SECS", v)?);
        }
        if let Some(v) = parse::<u64>(&lookup, "FACTLINE_IDEMPOTENCY_RETENTION_SECS")? {
            cfg.idempotency_retention = Duration::from_secs(v);
        }
        if let Some(v) = parse::<u32>(&lookup, "FACTLINE_COMMAND_ATTEMPTS")? {
            cfg.max_command_attempts = positive("FACTLINE_COMMAND_ATTEMPTS", v)?;
        }
        if let Some(v) = parse::<u64>(&lookup, "FACTLINE_RETRY_BACKOFF_MS")? {
            cfg.retry_backoff = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(&lookup, "FACTLINE_RETRY_BACKOFF_MAX_MS")? {
            cfg.retry_backoff_max = Duration::from_millis(v);
        }
        cfg.database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

        Ok(cfg)
    }

    pub fn lease_ttl_chrono(&self) -> chrono::Duration {
        to_chrono(self.lease_ttl)
    }

    pub fn idempotency_pending_ttl_chrono(&self) -> chrono::Duration {
        to_chrono(self.idempotency_pending_ttl)
    }

    pub fn idempotency_retention_chrono(&self) -> chrono::Duration {
        to_chrono(self.idempotency_retention)
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn positive<T: PartialEq + Default + ToString>(key: &'static str, v: T) -> Result<T, ConfigError> {
    if v == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: v.to_string(),
        });
    }
    Ok(v)
}
