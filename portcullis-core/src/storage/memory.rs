//! In-process cache-style driver.
//!
//! Behaves like a key-value store with native TTLs: counters and blocks carry
//! an expiry and disappear from every read once it passes. Each identifier
//! lives in one [`DashMap`] entry, and the shard lock held by the entry guard
//! makes every read-modify-write on that identifier atomic.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{GuardStorage, auto_block, stat};
use crate::{
    Error,
    block::{BackoffState, FailureCounter, SecurityBlock},
    clock::{Clock, SystemClock},
    config::LockoutPolicy,
    identifier::Identifier,
};

#[derive(Debug, Default, Clone)]
struct Record {
    failures: Option<FailureCounter>,
    block: Option<SecurityBlock>,
    consecutive_blocks: u32,
}

impl Record {
    /// Drop whatever has outlived its TTL.
    fn expire(&mut self, now: DateTime<Utc>) {
        if self.failures.as_ref().is_some_and(|c| !c.is_live(now)) {
            self.failures = None;
        }
        if self.block.as_ref().is_some_and(|b| !b.is_active(now)) {
            self.block = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.failures.is_none() && self.block.is_none() && self.consecutive_blocks == 0
    }
}

/// Guard storage held in process memory.
///
/// Suitable for single-instance deployments and tests. State is lost on
/// restart, and it is not shared between processes.
pub struct MemoryGuardStorage {
    records: DashMap<Identifier, Record>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryGuardStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryGuardStorage {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Use `clock` to decide when entries expire.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Apply `f` to the live record for `identifier` under its entry lock,
    /// removing the entry afterwards if nothing is left in it.
    fn update<T>(
        &self,
        identifier: &Identifier,
        f: impl FnOnce(&mut Record, DateTime<Utc>) -> T,
    ) -> T {
        let now = self.clock.now();
        let mut entry = self.records.entry(identifier.clone()).or_default();
        entry.expire(now);
        let result = f(entry.value_mut(), now);
        let empty = entry.is_empty();
        drop(entry);

        if empty {
            self.records
                .remove_if(identifier, |_, record| record.is_empty());
        }
        result
    }

    fn read<T>(&self, identifier: &Identifier, f: impl FnOnce(&Record) -> T) -> Option<T> {
        let now = self.clock.now();
        self.records.get(identifier).map(|entry| {
            let mut record = entry.value().clone();
            record.expire(now);
            f(&record)
        })
    }
}

#[async_trait]
impl GuardStorage for MemoryGuardStorage {
    async fn increment_failure(
        &self,
        identifier: &Identifier,
        window: Duration,
    ) -> Result<u32, Error> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);

        Ok(self.update(identifier, |record, now| {
            let counter = record.failures.get_or_insert_with(|| FailureCounter {
                identifier: identifier.clone(),
                count: 0,
                window_expires_at: now
                    .checked_add_signed(window)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            });
            counter.count = counter.count.saturating_add(1);
            counter.count
        }))
    }

    async fn reset_failure(&self, identifier: &Identifier) -> Result<(), Error> {
        self.update(identifier, |record, _| record.failures = None);
        Ok(())
    }

    async fn get_active_block(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<SecurityBlock>, Error> {
        Ok(self
            .read(identifier, |record| record.block.clone())
            .flatten())
    }

    async fn write_block(&self, block: &SecurityBlock) -> Result<(), Error> {
        self.update(&block.identifier, |record, _| {
            record.block = Some(block.clone());
        });
        Ok(())
    }

    async fn delete_block(&self, identifier: &Identifier) -> Result<(), Error> {
        self.update(identifier, |record, _| record.block = None);
        Ok(())
    }

    async fn get_backoff_state(&self, identifier: &Identifier) -> Result<BackoffState, Error> {
        let consecutive_blocks = self
            .read(identifier, |record| record.consecutive_blocks)
            .unwrap_or(0);
        Ok(BackoffState {
            identifier: identifier.clone(),
            consecutive_blocks,
        })
    }

    async fn set_backoff_state(&self, state: &BackoffState) -> Result<(), Error> {
        self.update(&state.identifier, |record, _| {
            record.consecutive_blocks = state.consecutive_blocks;
        });
        Ok(())
    }

    async fn open_auto_block(
        &self,
        identifier: &Identifier,
        policy: &LockoutPolicy,
        _now: DateTime<Utc>,
    ) -> Result<Option<SecurityBlock>, Error> {
        // The driver's own clock governs expiry, so the block starts on it too.
        Ok(self.update(identifier, |record, now| {
            if record.block.is_some() {
                return None;
            }
            let block = auto_block(identifier, policy, record.consecutive_blocks, now);
            record.block = Some(block.clone());
            record.consecutive_blocks = record.consecutive_blocks.saturating_add(1);
            Some(block)
        }))
    }

    async fn clear(&self, identifier: &Identifier) -> Result<(), Error> {
        self.records.remove(identifier);
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, Error> {
        // Expired entries are already invisible to every read. This only
        // reclaims their memory, so like any native-expiry store it reports
        // nothing swept.
        let now = self.clock.now();
        self.records.retain(|_, record| {
            record.expire(now);
            !record.is_empty()
        });
        Ok(0)
    }

    async fn stats(&self) -> Result<BTreeMap<String, u64>, Error> {
        let now = self.clock.now();
        let (mut active_blocks, mut tracked, mut backoff) = (0u64, 0u64, 0u64);

        for entry in self.records.iter() {
            let mut record = entry.value().clone();
            record.expire(now);
            active_blocks += u64::from(record.block.is_some());
            tracked += u64::from(record.failures.is_some());
            backoff += u64::from(record.consecutive_blocks > 0);
        }

        Ok(BTreeMap::from([
            (stat::ACTIVE_BLOCKS.to_string(), active_blocks),
            (stat::TRACKED_IDENTIFIERS.to_string(), tracked),
            (stat::BACKOFF_ENTRIES.to_string(), backoff),
        ]))
    }
}
