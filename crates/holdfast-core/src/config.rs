// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Holdfast core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// How many owner-registry entries to sweep for dead weak references
    /// per lookup
    pub owner_scan_batch: usize,
    /// Default timeout applied when callers pass `Duration::MAX`
    pub default_execute_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `HOLDFAST_OWNER_SCAN_BATCH`: registry entries pruned per lookup (default: 8)
    /// - `HOLDFAST_EXECUTE_TIMEOUT_MS`: default execute timeout in milliseconds (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let owner_scan_batch: usize = std::env::var("HOLDFAST_OWNER_SCAN_BATCH")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("HOLDFAST_OWNER_SCAN_BATCH", "must be a positive integer")
            })?;
        if owner_scan_batch == 0 {
            return Err(ConfigError::Invalid(
                "HOLDFAST_OWNER_SCAN_BATCH",
                "must be a positive integer",
            ));
        }

        let execute_timeout_ms: u64 = std::env::var("HOLDFAST_EXECUTE_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "HOLDFAST_EXECUTE_TIMEOUT_MS",
                    "must be a duration in milliseconds",
                )
            })?;

        Ok(Self {
            owner_scan_batch,
            default_execute_timeout: Duration::from_millis(execute_timeout_ms),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            owner_scan_batch: 8,
            default_execute_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
