//! Guard policy configuration.
//!
//! [`GuardConfig`] is immutable for the lifetime of a
//! [`GuardEngine`](crate::services::GuardEngine). Durations serialize as whole
//! seconds (`window_seconds`, `block_seconds`, ...) so the policy can be read
//! from any serde source.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, events::Platform, identifier::IdentifierMode};

/// Policy for failure counting, blocking, and backoff escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Length of the failure counting window.
    #[serde(rename = "window_seconds", with = "duration_secs")]
    pub window: Duration,

    /// Fixed block duration, used when backoff is disabled.
    #[serde(rename = "block_seconds", with = "duration_secs")]
    pub block_duration: Duration,

    /// Failures within one window that trigger an automatic block (inclusive).
    pub max_failures: u32,

    pub identifier_mode: IdentifierMode,

    /// Namespace mixed into every identifier hash.
    pub key_prefix: String,

    pub backoff_enabled: bool,

    #[serde(rename = "initial_backoff_seconds", with = "duration_secs")]
    pub initial_backoff: Duration,

    pub backoff_multiplier: f64,

    #[serde(rename = "max_backoff_seconds", with = "duration_secs")]
    pub max_backoff: Duration,

    /// Platform stamped on every emitted event.
    pub platform: Platform,

    /// Deadline applied to every storage call.
    #[serde(rename = "operation_timeout_seconds", with = "duration_secs")]
    pub operation_timeout: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(15 * 60),
            block_duration: Duration::from_secs(15 * 60),
            max_failures: 5,
            identifier_mode: IdentifierMode::IdentifierAndIp,
            key_prefix: "portcullis:".to_string(),
            backoff_enabled: true,
            initial_backoff: Duration::from_secs(5 * 60),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(60 * 60),
            platform: Platform::Web,
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl GuardConfig {
    /// Default policy with a fixed block duration instead of escalation.
    pub fn without_backoff() -> Self {
        Self {
            backoff_enabled: false,
            ..Self::default()
        }
    }

    /// Check the policy for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_failures == 0 {
            return Err(ConfigError::invalid("max_failures", "must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(ConfigError::invalid("window_seconds", "must be non-zero"));
        }
        if self.operation_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "operation_timeout_seconds",
                "must be non-zero",
            ));
        }

        if self.backoff_enabled {
            if !self.backoff_multiplier.is_finite() || self.backoff_multiplier <= 1.0 {
                return Err(ConfigError::invalid(
                    "backoff_multiplier",
                    format!(
                        "must be greater than 1 when backoff is enabled, got {}",
                        self.backoff_multiplier
                    ),
                ));
            }
            if self.initial_backoff.is_zero() {
                return Err(ConfigError::invalid(
                    "initial_backoff_seconds",
                    "must be non-zero",
                ));
            }
            if self.max_backoff < self.initial_backoff {
                return Err(ConfigError::invalid(
                    "max_backoff_seconds",
                    "must not be smaller than initial_backoff_seconds",
                ));
            }
        } else if self.block_duration.is_zero() {
            return Err(ConfigError::invalid("block_seconds", "must be non-zero"));
        }

        Ok(())
    }

    pub fn lockout_policy(&self) -> LockoutPolicy {
        LockoutPolicy {
            backoff_enabled: self.backoff_enabled,
            block_duration: self.block_duration,
            initial_backoff: self.initial_backoff,
            backoff_multiplier: self.backoff_multiplier,
            max_backoff: self.max_backoff,
        }
    }
}

/// The part of the policy a storage driver needs to open an automatic block
/// atomically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockoutPolicy {
    pub backoff_enabled: bool,
    pub block_duration: Duration,
    pub initial_backoff: Duration,
    pub backoff_multiplier: f64,
    pub max_backoff: Duration,
}

impl LockoutPolicy {
    /// Block duration for an identifier that has already been blocked
    /// `consecutive_blocks` times in a row.
    pub fn duration_for(&self, consecutive_blocks: u32) -> Duration {
        if !self.backoff_enabled {
            return self.block_duration;
        }

        let exponent = i32::try_from(consecutive_blocks).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let cap = self.max_backoff.as_secs_f64();

        if !secs.is_finite() || secs >= cap {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
