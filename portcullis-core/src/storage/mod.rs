//! Storage capability consumed by the guard engine.
//!
//! A [`GuardStorage`] owns every piece of per-identifier state: failure
//! counters, blocks, and backoff state. The engine holds none of it, so any
//! number of engine instances can share one backend.
//!
//! # Backend families
//!
//! - Native-expiry stores ([`MemoryGuardStorage`]) realize counter windows and
//!   block lifetimes with per-entry TTLs; [`GuardStorage::sweep_expired`] is a
//!   no-op for them.
//! - Relational stores keep explicit expiry columns, check them on every read,
//!   and physically delete expired rows in `sweep_expired`.
//!
//! Every backend must look identical from the engine's side.

pub mod memory;

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    Error,
    block::{BackoffState, BlockType, SecurityBlock},
    config::LockoutPolicy,
    identifier::Identifier,
};

pub use memory::MemoryGuardStorage;

/// Stat keys every shipped backend reports.
pub mod stat {
    pub const ACTIVE_BLOCKS: &str = "active_blocks";
    pub const TRACKED_IDENTIFIERS: &str = "tracked_identifiers";
    pub const BACKOFF_ENTRIES: &str = "backoff_entries";
    pub const SWEPT_TOTAL: &str = "swept_total";
}

/// Atomic counter, block, and backoff primitives.
///
/// Implementations must be safe to call concurrently for the same identifier:
/// `increment_failure` may never lose an update, and `open_auto_block` must
/// open at most one block per threshold crossing.
#[async_trait]
pub trait GuardStorage: Send + Sync + 'static {
    /// Count one failure.
    ///
    /// Creates the counter with a lifetime of `window` if none is live,
    /// otherwise increments it and leaves its expiry untouched.
    ///
    /// # Returns
    ///
    /// The count after this increment.
    async fn increment_failure(&self, identifier: &Identifier, window: Duration)
    -> Result<u32, Error>;

    /// Drop the failure counter.
    async fn reset_failure(&self, identifier: &Identifier) -> Result<(), Error>;

    /// The block for `identifier`, only if it has not expired.
    ///
    /// Backends without native expiry must compare `blocked_until` themselves.
    /// A record that cannot be decoded is reported as no block.
    async fn get_active_block(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<SecurityBlock>, Error>;

    /// Insert or replace the block for `block.identifier`.
    async fn write_block(&self, block: &SecurityBlock) -> Result<(), Error>;

    async fn delete_block(&self, identifier: &Identifier) -> Result<(), Error>;

    /// Backoff state, defaulting to zero consecutive blocks.
    async fn get_backoff_state(&self, identifier: &Identifier) -> Result<BackoffState, Error>;

    async fn set_backoff_state(&self, state: &BackoffState) -> Result<(), Error>;

    /// Open an automatic block unless one is already active.
    ///
    /// Reads the backoff state, computes the duration from `policy`, writes an
    /// [`BlockType::Auto`] block starting at `now`, and stores the backoff
    /// state incremented by one.
    ///
    /// The default implementation composes the primitives above and is only
    /// safe against concurrent callers if the backend serializes them some
    /// other way; it writes the block before the backoff state so a failure in
    /// between leaves a block without escalation rather than escalation
    /// without a block. Shipped backends override it with one atomic unit.
    ///
    /// # Returns
    ///
    /// The new block, or `None` if an active block already existed.
    async fn open_auto_block(
        &self,
        identifier: &Identifier,
        policy: &LockoutPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<SecurityBlock>, Error> {
        if self.get_active_block(identifier).await?.is_some() {
            return Ok(None);
        }

        let mut backoff = self.get_backoff_state(identifier).await?;
        let block = auto_block(identifier, policy, backoff.consecutive_blocks, now);
        self.write_block(&block).await?;

        backoff.consecutive_blocks = backoff.consecutive_blocks.saturating_add(1);
        self.set_backoff_state(&backoff).await?;

        Ok(Some(block))
    }

    /// Remove the block and the failure counter and reset backoff to zero.
    async fn clear(&self, identifier: &Identifier) -> Result<(), Error> {
        self.delete_block(identifier).await?;
        self.reset_failure(identifier).await?;
        self.set_backoff_state(&BackoffState::new(identifier.clone()))
            .await
    }

    /// Physically remove expired counters and blocks.
    ///
    /// # Returns
    ///
    /// The number of records removed. Always zero for native-expiry backends.
    async fn sweep_expired(&self) -> Result<u64, Error>;

    /// Advisory counters keyed by the names in [`stat`].
    async fn stats(&self) -> Result<BTreeMap<String, u64>, Error>;

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Build the automatic block for an identifier that has been blocked
/// `consecutive_blocks` times in a row.
pub fn auto_block(
    identifier: &Identifier,
    policy: &LockoutPolicy,
    consecutive_blocks: u32,
    now: DateTime<Utc>,
) -> SecurityBlock {
    let duration = policy.duration_for(consecutive_blocks);
    let duration = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);

    SecurityBlock {
        identifier: identifier.clone(),
        block_type: BlockType::Auto,
        blocked_at: now,
        blocked_until: now
            .checked_add_signed(duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}
