// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Durastep engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL. In-memory persistence is used when unset.
    pub database_url: Option<String>,
    /// Maximum transitions a worker runs at once
    pub max_concurrent_transitions: usize,
    /// Delay between queue polls when the queue is empty
    pub poll_interval: Duration,
    /// Maximum transitions claimed per poll
    pub batch_size: usize,
    /// Deliveries of one transition before it is marked failed
    pub max_attempts: u32,
    /// Age after which an unacknowledged claim returns to the queue
    pub claim_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            max_concurrent_transitions: 16,
            poll_interval: Duration::from_millis(100),
            batch_size: 32,
            max_attempts: 5,
            claim_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `DURASTEP_DATABASE_URL`: SQLite connection string (default: in-memory persistence)
    /// - `DURASTEP_MAX_CONCURRENT_TRANSITIONS`: Max concurrent transitions (default: 16)
    /// - `DURASTEP_POLL_INTERVAL_MS`: Queue poll interval in milliseconds (default: 100)
    /// - `DURASTEP_BATCH_SIZE`: Transitions claimed per poll (default: 32)
    /// - `DURASTEP_MAX_ATTEMPTS`: Deliveries before a transition fails (default: 5)
    /// - `DURASTEP_CLAIM_TIMEOUT_SECS`: Seconds before an unacknowledged claim is
    ///   reclaimed (default: 300)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = std::env::var("DURASTEP_DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());

        let max_concurrent_transitions = positive(
            "DURASTEP_MAX_CONCURRENT_TRANSITIONS",
            defaults.max_concurrent_transitions,
        )?;

        let poll_interval_ms: u64 = std::env::var("DURASTEP_POLL_INTERVAL_MS")
            .map(|v| v.parse())
            .unwrap_or(Ok(defaults.poll_interval.as_millis() as u64))
            .map_err(|_| {
                ConfigError::Invalid("DURASTEP_POLL_INTERVAL_MS", "must be a number of milliseconds")
            })?;

        let batch_size = positive("DURASTEP_BATCH_SIZE", defaults.batch_size)?;
        let max_attempts = positive("DURASTEP_MAX_ATTEMPTS", defaults.max_attempts as usize)?;
        let claim_timeout_secs = positive(
            "DURASTEP_CLAIM_TIMEOUT_SECS",
            defaults.claim_timeout.as_secs() as usize,
        )?;

        Ok(Self {
            database_url,
            max_concurrent_transitions,
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            max_attempts: u32::try_from(max_attempts)
                .map_err(|_| ConfigError::Invalid("DURASTEP_MAX_ATTEMPTS", "value too large"))?,
            claim_timeout: Duration::from_secs(claim_timeout_secs as u64),
        })
    }
}

fn positive(key: &'static str, default: usize) -> Result<usize, ConfigError> {
    let value: usize = match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a positive integer"))?,
        Err(_) => default,
    };
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
