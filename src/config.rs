//! Runtime configuration for the network layer.
//!
//! All timing is expressed in logical ticks or in seconds that are converted
//! to ticks with the configured rate, so a test scheduler can drive every
//! timeout deterministically.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating a [`NetworkConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The JSON document could not be parsed.
    #[error("invalid network configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value the network layer cannot run with.
    #[error("network configuration field `{field}` must be greater than zero")]
    Zero {
        /// Name of the offending field.
        field: &'static str,
    },
}

/// Tunables shared by the registry, agents and client runtimes.
///
/// # Examples
///
/// ```
/// use switchboard::config::NetworkConfig;
///
/// let config = NetworkConfig::default();
/// assert_eq!(config.ticks_per_second, 10);
/// assert_eq!(config.retry_cap_ticks(), 50);
///
/// let parsed = NetworkConfig::from_json_str(r#"{"ticks_per_second": 4}"#)
///     .expect("valid configuration");
/// assert_eq!(parsed.retry_cap_ticks(), 20);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Rate of the logical clock.
    pub ticks_per_second: u32,
    /// Agents silent for longer than this are evicted from the directory.
    pub alive_timeout_secs: u64,
    /// Containers without holders are terminated after this long.
    pub unused_container_timeout_secs: u64,
    /// Period of the registry alive/orphan sweep.
    pub housekeeping_interval_ticks: u64,
    /// Period of the client runtime keep-alive ping.
    pub ping_interval_ticks: u64,
    /// Resolution backoff is capped at this many seconds worth of ticks.
    pub retry_cap_multiplier: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: 10,
            alive_timeout_secs: 10,
            unused_container_timeout_secs: 60,
            housekeeping_interval_ticks: 10,
            ping_interval_ticks: 20,
            retry_cap_multiplier: 5,
        }
    }
}

impl NetworkConfig {
    /// Creates a configuration suited to single-stepped tests.
    ///
    /// One tick per second keeps tick arithmetic readable and every sweep
    /// runs on each tick.
    #[must_use]
    pub const fn testing() -> Self {
        Self {
            ticks_per_second: 1,
            alive_timeout_secs: 3,
            unused_container_timeout_secs: 5,
            housekeeping_interval_ticks: 1,
            ping_interval_ticks: 1,
            retry_cap_multiplier: 5,
        }
    }

    /// Parses a JSON document, filling absent fields with defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Zero`] when validation fails.
    pub fn from_json_str(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that rates and intervals are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Zero`] naming the first zero field.
    pub const fn validate(&self) -> Result<(), ConfigError> {
        if self.ticks_per_second == 0 {
            return Err(ConfigError::Zero {
                field: "ticks_per_second",
            });
        }
        if self.housekeeping_interval_ticks == 0 {
            return Err(ConfigError::Zero {
                field: "housekeeping_interval_ticks",
            });
        }
        if self.ping_interval_ticks == 0 {
            return Err(ConfigError::Zero {
                field: "ping_interval_ticks",
            });
        }
        if self.retry_cap_multiplier == 0 {
            return Err(ConfigError::Zero {
                field: "retry_cap_multiplier",
            });
        }
        Ok(())
    }

    /// Converts whole seconds into ticks at the configured rate.
    #[must_use]
    pub fn seconds_to_ticks(&self, seconds: u64) -> u64 {
        seconds.saturating_mul(u64::from(self.ticks_per_second))
    }

    /// Upper bound on a single resolution backoff wait.
    #[must_use]
    pub fn retry_cap_ticks(&self) -> u64 {
        self.seconds_to_ticks(self.retry_cap_multiplier)
    }

    /// Agent inactivity limit in ticks.
    #[must_use]
    pub fn alive_timeout_ticks(&self) -> u64 {
        self.seconds_to_ticks(self.alive_timeout_secs)
    }

    /// Orphaned container limit in ticks.
    #[must_use]
    pub fn unused_container_timeout_ticks(&self) -> u64 {
        self.seconds_to_ticks(self.unused_container_timeout_secs)
    }
}
