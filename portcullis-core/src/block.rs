//! Records owned by storage drivers.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifier::Identifier;

/// How a block came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Opened by the engine when the failure threshold was reached.
    Auto,
    /// Placed by an operator.
    Manual,
    /// Placed by another automated system (fraud scoring, abuse reports).
    System,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Auto => "auto",
            BlockType::Manual => "manual",
            BlockType::System => "system",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BlockType::Auto),
            "manual" => Ok(BlockType::Manual),
            "system" => Ok(BlockType::System),
            other => Err(format!("unknown block type: {other}")),
        }
    }
}

/// A lockout of one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityBlock {
    pub identifier: Identifier,
    pub block_type: BlockType,
    pub blocked_at: DateTime<Utc>,
    pub blocked_until: DateTime<Utc>,
}

impl SecurityBlock {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.blocked_until > now
    }

    /// Whole seconds left, rounded up so a block with 200ms left still
    /// reports one second.
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.blocked_until - now;
        let millis = remaining.num_milliseconds();
        if millis <= 0 {
            0
        } else {
            (millis as u64).div_ceil(1000)
        }
    }
}

/// Failures counted inside the current window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCounter {
    pub identifier: Identifier,
    pub count: u32,
    pub window_expires_at: DateTime<Utc>,
}

impl FailureCounter {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.window_expires_at > now
    }
}

/// Number of automatic blocks in a row without an intervening unblock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffState {
    pub identifier: Identifier,
    pub consecutive_blocks: u32,
}

impl BackoffState {
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            consecutive_blocks: 0,
        }
    }
}
