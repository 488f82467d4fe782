//! Guard engine: failure counting, automatic blocking, and backoff escalation.
//!
//! The engine answers one question, "is this identifier blocked and for how
//! long", from a stream of reported failures. It does not verify credentials.
//!
//! # State per identifier
//!
//! ```text
//! clear ──failure──▶ tracking ──count >= max_failures──▶ blocked
//!   ▲                   │                                   │
//!   └──window expiry────┘◀──────unblock / block expiry──────┘
//! ```
//!
//! Every piece of that state lives in the [`GuardStorage`]; the engine keeps
//! nothing between calls, so any number of engines may share one backend.
//!
//! # Example
//!
//! ```rust,ignore
//! use portcullis_core::services::{FailedAttempt, GuardEngine};
//! use portcullis_core::{GuardConfig, MemoryGuardStorage, Target};
//!
//! let engine = GuardEngine::new(Arc::new(MemoryGuardStorage::new()), GuardConfig::default())?;
//! let target = Target::new("203.0.113.7", "alice@example.com");
//!
//! if engine.is_blocked(&target).await? {
//!     // reject before checking the password
//! }
//!
//! // after the password check failed
//! engine.record_failure(&target, FailedAttempt::default()).await?;
//! ```

use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};

use crate::{
    Error,
    block::{BlockType, SecurityBlock},
    clock::{Clock, SystemClock},
    config::{GuardConfig, LockoutPolicy},
    error::{ConfigError, StorageError},
    events::{EventSink, NoopEventSink, SecurityAction, SecurityEvent},
    identifier::{Identifier, IdentifierStrategy, Target},
    storage::GuardStorage,
};

/// Per-call details of a failed login.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailedAttempt {
    /// When the failure happened; defaults to the engine clock.
    pub attempted_at: Option<DateTime<Utc>>,
    /// Counting window for this call only; defaults to the configured window.
    pub window: Option<Duration>,
    pub device_id: Option<String>,
}

impl FailedAttempt {
    pub fn at(mut self, attempted_at: DateTime<Utc>) -> Self {
        self.attempted_at = Some(attempted_at);
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// How long a requested block lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLength {
    For(Duration),
    Until(DateTime<Utc>),
}

/// A caller-placed block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRequest {
    pub block_type: BlockType,
    pub length: BlockLength,
    /// Free-form note carried on the `block_created` event.
    pub reason: Option<String>,
}

impl BlockRequest {
    pub fn manual(duration: Duration) -> Self {
        Self {
            block_type: BlockType::Manual,
            length: BlockLength::For(duration),
            reason: None,
        }
    }

    pub fn system(duration: Duration) -> Self {
        Self {
            block_type: BlockType::System,
            length: BlockLength::For(duration),
            reason: None,
        }
    }

    pub fn until(mut self, blocked_until: DateTime<Utc>) -> Self {
        self.length = BlockLength::Until(blocked_until);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Orchestrates identifier derivation, storage, and backoff policy.
///
/// # Thread Safety
///
/// The engine is `Send + Sync` and meant to be shared behind an `Arc`.
/// Concurrency guarantees come from the storage backend's atomic operations.
pub struct GuardEngine<S: GuardStorage + ?Sized> {
    storage: Arc<S>,
    config: GuardConfig,
    policy: LockoutPolicy,
    strategy: IdentifierStrategy,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
}

impl<S: GuardStorage + ?Sized> GuardEngine<S> {
    /// Create an engine with no event sink and the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` fails [`GuardConfig::validate`].
    pub fn new(storage: Arc<S>, config: GuardConfig) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            storage,
            policy: config.lockout_policy(),
            strategy: IdentifierStrategy::new(config.identifier_mode, config.key_prefix.clone()),
            config,
            events: Arc::new(NoopEventSink),
            clock: Arc::new(SystemClock),
        })
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// The storage key the engine uses for `target`.
    pub fn identifier_for(&self, target: &Target) -> Result<Identifier, Error> {
        Ok(self.strategy.for_target(target)?)
    }

    /// Record a failed login and block the identifier once the threshold is
    /// reached.
    ///
    /// Always emits `login_attempt`. When this call brings the count to
    /// `max_failures` or beyond and no block is active, an automatic block is
    /// opened, its length escalated by backoff, and `block_created` follows.
    ///
    /// # Returns
    ///
    /// The failure count in the current window, including this failure.
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] if the backend fails or misses the deadline. If the
    /// increment itself failed, the attempt was not recorded.
    pub async fn record_failure(
        &self,
        target: &Target,
        attempt: FailedAttempt,
    ) -> Result<u32, Error> {
        let identifier = self.identifier_for(target)?;
        let window = attempt.window.unwrap_or(self.config.window);
        if window.is_zero() {
            return Err(
                ConfigError::invalid("window", "per-attempt window override must be non-zero")
                    .into(),
            );
        }

        let count = self
            .deadline(self.storage.increment_failure(&identifier, window))
            .await?;
        let now = self.clock.now();

        tracing::debug!(
            identifier = %identifier,
            count = count,
            max_failures = self.config.max_failures,
            "Recorded failed login attempt"
        );

        let mut event = self
            .event(
                SecurityAction::LoginAttempt,
                attempt.attempted_at.unwrap_or(now),
                Some(target),
            )
            .with_meta("identifier", identifier.as_str())
            .with_meta("count", count)
            .with_meta("max_failures", self.config.max_failures)
            .with_meta("window_seconds", window.as_secs());
        if let Some(device_id) = &attempt.device_id {
            event = event.with_meta("device_id", device_id.as_str());
        }
        self.events.dispatch(&event).await;

        if count >= self.config.max_failures {
            let opened = self
                .deadline(self.storage.open_auto_block(&identifier, &self.policy, now))
                .await?;

            if let Some(block) = opened {
                let duration = (block.blocked_until - block.blocked_at).num_seconds();
                tracing::warn!(
                    identifier = %identifier,
                    count = count,
                    blocked_until = %block.blocked_until,
                    duration_seconds = duration,
                    "Failure threshold reached, identifier blocked"
                );

                let event = self
                    .event(SecurityAction::BlockCreated, now, Some(target))
                    .with_meta("identifier", identifier.as_str())
                    .with_meta("block_type", block.block_type.as_str())
                    .with_meta("blocked_until", block.blocked_until.to_rfc3339())
                    .with_meta("duration_seconds", duration)
                    .with_meta("count", count);
                self.events.dispatch(&event).await;
            }
        }

        Ok(count)
    }

    /// Forget the failure count, typically after a successful login.
    ///
    /// An active block and the backoff state are left alone, so a successful
    /// login cannot shorten a lockout already in force. No event is emitted.
    pub async fn reset_attempts(&self, target: &Target) -> Result<(), Error> {
        let identifier = self.identifier_for(target)?;
        self.deadline(self.storage.reset_failure(&identifier)).await?;

        tracing::debug!(identifier = %identifier, "Reset failed login attempts");
        Ok(())
    }

    pub async fn is_blocked(&self, target: &Target) -> Result<bool, Error> {
        Ok(self.get_active_block(target).await?.is_some())
    }

    /// The active block, if any. A block past its `blocked_until` by the
    /// engine clock counts as no block even if storage still returned it.
    pub async fn get_active_block(&self, target: &Target) -> Result<Option<SecurityBlock>, Error> {
        let identifier = self.identifier_for(target)?;
        let block = self
            .deadline(self.storage.get_active_block(&identifier))
            .await?;
        let now = self.clock.now();

        Ok(block.filter(|b| b.is_active(now)))
    }

    /// Seconds until the active block lifts, rounded up; `None` when not blocked.
    pub async fn get_remaining_block_seconds(&self, target: &Target) -> Result<Option<u64>, Error> {
        let block = self.get_active_block(target).await?;
        let now = self.clock.now();
        Ok(block.map(|b| b.remaining_seconds(now)))
    }

    /// Place a manual or system block, replacing any existing block.
    ///
    /// Failure counter and backoff state are not touched.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an `auto` block type, a zero duration, or an end
    /// time that is not in the future.
    pub async fn block(
        &self,
        target: &Target,
        request: BlockRequest,
    ) -> Result<SecurityBlock, Error> {
        if request.block_type == BlockType::Auto {
            return Err(ConfigError::invalid(
                "block_type",
                "automatic blocks are only opened by the engine",
            )
            .into());
        }

        let identifier = self.identifier_for(target)?;
        let now = self.clock.now();
        let blocked_until = match request.length {
            BlockLength::For(duration) if duration.is_zero() => {
                return Err(
                    ConfigError::invalid("duration", "block duration must be non-zero").into(),
                );
            }
            BlockLength::For(duration) => chrono::Duration::from_std(duration)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            BlockLength::Until(until) if until <= now => {
                return Err(
                    ConfigError::invalid("blocked_until", "must be in the future").into(),
                );
            }
            BlockLength::Until(until) => until,
        };

        let block = SecurityBlock {
            identifier: identifier.clone(),
            block_type: request.block_type,
            blocked_at: now,
            blocked_until,
        };
        self.deadline(self.storage.write_block(&block)).await?;

        tracing::info!(
            identifier = %identifier,
            block_type = block.block_type.as_str(),
            blocked_until = %block.blocked_until,
            "Identifier blocked on request"
        );

        let mut event = self
            .event(SecurityAction::BlockCreated, now, Some(target))
            .with_meta("identifier", identifier.as_str())
            .with_meta("block_type", block.block_type.as_str())
            .with_meta("blocked_until", block.blocked_until.to_rfc3339())
            .with_meta(
                "duration_seconds",
                (block.blocked_until - block.blocked_at).num_seconds(),
            );
        if let Some(reason) = request.reason {
            event = event.with_meta("reason", reason);
        }
        self.events.dispatch(&event).await;

        Ok(block)
    }

    /// Lift any block, clear the failure count, and reset backoff escalation.
    ///
    /// This is the only operation that resets backoff. It is idempotent and
    /// emits `block_removed` even when nothing was blocked.
    ///
    /// # Returns
    ///
    /// `true` if an active block was present beforehand.
    pub async fn unblock(&self, target: &Target) -> Result<bool, Error> {
        let was_blocked = self.is_blocked(target).await?;
        let identifier = self.identifier_for(target)?;
        self.deadline(self.storage.clear(&identifier)).await?;

        tracing::info!(
            identifier = %identifier,
            was_blocked = was_blocked,
            "Identifier unblocked"
        );

        let event = self
            .event(SecurityAction::BlockRemoved, self.clock.now(), Some(target))
            .with_meta("identifier", identifier.as_str())
            .with_meta("was_blocked", was_blocked);
        self.events.dispatch(&event).await;

        Ok(was_blocked)
    }

    /// Remove expired records from backends without native expiry.
    ///
    /// Emits a single `cleanup` event regardless of how much was removed.
    ///
    /// # Returns
    ///
    /// The number of records the backend removed.
    pub async fn cleanup(&self) -> Result<u64, Error> {
        let swept = self.deadline(self.storage.sweep_expired()).await?;

        tracing::info!(swept = swept, "Swept expired guard records");

        let event = self.event(SecurityAction::Cleanup, self.clock.now(), None);
        self.events.dispatch(&event).await;

        Ok(swept)
    }

    /// Advisory backend counters. Never consulted for blocking decisions.
    pub async fn get_stats(&self) -> Result<BTreeMap<String, u64>, Error> {
        self.deadline(self.storage.stats()).await
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.deadline(self.storage.health_check()).await
    }

    /// Bound a storage call by the configured operation timeout.
    async fn deadline<T>(&self, call: impl Future<Output = Result<T, Error>>) -> Result<T, Error> {
        let limit = self.config.operation_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?limit, "Guard storage call timed out");
                Err(StorageError::Timeout(limit).into())
            }
        }
    }

    fn event(
        &self,
        action: SecurityAction,
        timestamp: DateTime<Utc>,
        target: Option<&Target>,
    ) -> SecurityEvent {
        let event = SecurityEvent::new(action, self.config.platform, timestamp);
        match target {
            Some(target) => event.with_origin(target.ip.as_str(), target.subject.as_str()),
            None => event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::BackoffState,
        clock::ManualClock,
        events::tests::RecordingSink,
        identifier::IdentifierMode,
        storage::MemoryGuardStorage,
    };
    use async_trait::async_trait;
    use serde_json::json;

    struct Harness {
        engine: GuardEngine<MemoryGuardStorage>,
        clock: Arc<ManualClock>,
        sink: Arc<RecordingSink>,
    }

    fn harness(config: GuardConfig) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let sink = Arc::new(RecordingSink::default());
        let storage = Arc::new(MemoryGuardStorage::with_clock(clock.clone()));
        let engine = GuardEngine::new(storage, config)
            .unwrap()
            .with_event_sink(sink.clone())
            .with_clock(clock.clone());
        Harness {
            engine,
            clock,
            sink,
        }
    }

    fn alice() -> Target {
        Target::new("1.2.3.4", "alice")
    }

    fn scenario_config() -> GuardConfig {
        GuardConfig {
            window: Duration::from_secs(60),
            max_failures: 3,
            block_duration: Duration::from_secs(300),
            ..GuardConfig::without_backoff()
        }
    }

    #[test]
    fn test_invalid_config_rejected_at_construction() {
        let config = GuardConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        let result = GuardEngine::new(Arc::new(MemoryGuardStorage::new()), config);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_counts_are_monotonic_within_window() {
        let h = harness(GuardConfig {
            max_failures: 100,
            ..Default::default()
        });

        for expected in 1..=10 {
            let count = h
                .engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap();
            assert_eq!(count, expected);
        }
        assert!(!h.engine.is_blocked(&alice()).await.unwrap());
    }

    #[tokio::test]
    async fn test_threshold_crossing_blocks_once() {
        let h = harness(GuardConfig {
            max_failures: 5,
            ..Default::default()
        });

        for _ in 0..4 {
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap();
        }
        assert_eq!(h.sink.count(SecurityAction::BlockCreated), 0);
        assert_eq!(h.sink.count(SecurityAction::LoginAttempt), 4);

        let count = h
            .engine
            .record_failure(&alice(), FailedAttempt::default())
            .await
            .unwrap();
        assert_eq!(count, 5);
        assert_eq!(h.sink.count(SecurityAction::BlockCreated), 1);

        let block = h.engine.get_active_block(&alice()).await.unwrap().unwrap();
        assert_eq!(block.block_type, BlockType::Auto);

        // Further failures while blocked do not open another block
        h.engine
            .record_failure(&alice(), FailedAttempt::default())
            .await
            .unwrap();
        assert_eq!(h.sink.count(SecurityAction::BlockCreated), 1);
    }

    #[tokio::test]
    async fn test_login_attempt_precedes_block_created() {
        let h = harness(scenario_config());
        for _ in 0..3 {
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap();
        }

        assert_eq!(
            h.sink.actions(),
            vec![
                SecurityAction::LoginAttempt,
                SecurityAction::LoginAttempt,
                SecurityAction::LoginAttempt,
                SecurityAction::BlockCreated,
            ]
        );

        let events = h.sink.events.lock().unwrap();
        assert_eq!(events[2].meta["count"], json!(3));
        assert_eq!(events[3].meta["block_type"], json!("auto"));
        assert_eq!(events[3].ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(events[3].subject.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_backoff_escalates_and_caps() {
        let h = harness(GuardConfig {
            window: Duration::from_secs(60),
            max_failures: 3,
            backoff_enabled: true,
            initial_backoff: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(3600),
            ..Default::default()
        });

        let mut durations = Vec::new();
        for _ in 0..6 {
            for _ in 0..3 {
                h.engine
                    .record_failure(&alice(), FailedAttempt::default())
                    .await
                    .unwrap();
            }
            let block = h.engine.get_active_block(&alice()).await.unwrap().unwrap();
            let duration = (block.blocked_until - block.blocked_at).num_seconds();
            durations.push(duration);

            // Let both the block and the counting window lapse
            h.clock.advance(chrono::Duration::seconds(duration + 61));
            assert!(!h.engine.is_blocked(&alice()).await.unwrap());
        }

        assert_eq!(durations, vec![300, 600, 1200, 2400, 3600, 3600]);
    }

    #[tokio::test]
    async fn test_scenario_block_then_unblock() {
        let h = harness(scenario_config());

        let counts = [
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap(),
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap(),
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap(),
        ];
        assert_eq!(counts, [1, 2, 3]);

        let block = h.engine.get_active_block(&alice()).await.unwrap().unwrap();
        assert_eq!(
            block.blocked_until,
            h.clock.now() + chrono::Duration::seconds(300)
        );
        assert!(h.engine.is_blocked(&alice()).await.unwrap());
        assert_eq!(
            h.engine
                .get_remaining_block_seconds(&alice())
                .await
                .unwrap(),
            Some(300)
        );

        assert!(h.engine.unblock(&alice()).await.unwrap());
        assert!(!h.engine.is_blocked(&alice()).await.unwrap());
        assert_eq!(
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_unblock_is_idempotent() {
        let h = harness(GuardConfig::default());
        let identifier = h.engine.identifier_for(&alice()).unwrap();
        h.engine
            .storage()
            .set_backoff_state(&BackoffState {
                identifier: identifier.clone(),
                consecutive_blocks: 4,
            })
            .await
            .unwrap();

        assert!(!h.engine.unblock(&alice()).await.unwrap());
        assert!(!h.engine.unblock(&alice()).await.unwrap());

        assert_eq!(h.sink.count(SecurityAction::BlockRemoved), 2);
        let backoff = h
            .engine
            .storage()
            .get_backoff_state(&identifier)
            .await
            .unwrap();
        assert_eq!(backoff.consecutive_blocks, 0);
    }

    #[tokio::test]
    async fn test_window_expiry_starts_fresh_count() {
        let h = harness(scenario_config());

        h.engine
            .record_failure(&alice(), FailedAttempt::default())
            .await
            .unwrap();
        h.engine
            .record_failure(&alice(), FailedAttempt::default())
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::seconds(60));
        assert_eq!(
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_window_override_applies_per_call() {
        let h = harness(scenario_config());
        let short = FailedAttempt::default().with_window(Duration::from_secs(5));

        h.engine
            .record_failure(&alice(), short.clone())
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(6));
        assert_eq!(h.engine.record_failure(&alice(), short).await.unwrap(), 1);

        let zero = FailedAttempt::default().with_window(Duration::ZERO);
        let err = h.engine.record_failure(&alice(), zero).await.unwrap_err();
        assert!(err.is_config_error());
    }

    #[tokio::test]
    async fn test_reset_attempts_keeps_block_and_backoff() {
        let h = harness(scenario_config());
        for _ in 0..3 {
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap();
        }
        let events_before = h.sink.actions().len();

        h.engine.reset_attempts(&alice()).await.unwrap();

        assert!(h.engine.is_blocked(&alice()).await.unwrap());
        let identifier = h.engine.identifier_for(&alice()).unwrap();
        let backoff = h
            .engine
            .storage()
            .get_backoff_state(&identifier)
            .await
            .unwrap();
        assert_eq!(backoff.consecutive_blocks, 1);
        assert_eq!(h.sink.actions().len(), events_before);

        assert_eq!(
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_manual_block_overwrites_and_leaves_counter() {
        let h = harness(scenario_config());
        h.engine
            .record_failure(&alice(), FailedAttempt::default())
            .await
            .unwrap();

        let block = h
            .engine
            .block(
                &alice(),
                BlockRequest::manual(Duration::from_secs(3600)).with_reason("support ticket 42"),
            )
            .await
            .unwrap();
        assert_eq!(block.block_type, BlockType::Manual);

        let replaced = h
            .engine
            .block(&alice(), BlockRequest::system(Duration::from_secs(60)))
            .await
            .unwrap();
        let active = h.engine.get_active_block(&alice()).await.unwrap().unwrap();
        assert_eq!(active, replaced);

        assert_eq!(
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap(),
            2
        );
        assert_eq!(h.sink.count(SecurityAction::BlockCreated), 2);

        let identifier = h.engine.identifier_for(&alice()).unwrap();
        let backoff = h
            .engine
            .storage()
            .get_backoff_state(&identifier)
            .await
            .unwrap();
        assert_eq!(backoff.consecutive_blocks, 0);

        let events = h.sink.events.lock().unwrap();
        assert_eq!(events[1].meta["reason"], json!("support ticket 42"));
    }

    #[tokio::test]
    async fn test_invalid_block_requests_rejected() {
        let h = harness(GuardConfig::default());

        let auto = BlockRequest {
            block_type: BlockType::Auto,
            length: BlockLength::For(Duration::from_secs(60)),
            reason: None,
        };
        assert!(
            h.engine.block(&alice(), auto).await.unwrap_err().is_config_error()
        );

        let zero = BlockRequest::manual(Duration::ZERO);
        assert!(
            h.engine.block(&alice(), zero).await.unwrap_err().is_config_error()
        );

        let past = BlockRequest::manual(Duration::from_secs(1))
            .until(h.clock.now() - chrono::Duration::seconds(1));
        assert!(
            h.engine.block(&alice(), past).await.unwrap_err().is_config_error()
        );

        assert!(!h.engine.is_blocked(&alice()).await.unwrap());
        assert_eq!(h.sink.count(SecurityAction::BlockCreated), 0);
    }

    #[tokio::test]
    async fn test_remaining_seconds_counts_down() {
        let h = harness(GuardConfig::default());
        assert_eq!(
            h.engine
                .get_remaining_block_seconds(&alice())
                .await
                .unwrap(),
            None
        );

        let until = h.clock.now() + chrono::Duration::seconds(120);
        h.engine
            .block(
                &alice(),
                BlockRequest::manual(Duration::from_secs(1)).until(until),
            )
            .await
            .unwrap();

        h.clock.advance(chrono::Duration::seconds(100));
        assert_eq!(
            h.engine
                .get_remaining_block_seconds(&alice())
                .await
                .unwrap(),
            Some(20)
        );

        h.clock.advance(chrono::Duration::seconds(20));
        assert_eq!(
            h.engine
                .get_remaining_block_seconds(&alice())
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_identifier_modes_share_or_split_state() {
        let h = harness(GuardConfig {
            identifier_mode: IdentifierMode::IdentifierOnly,
            max_failures: 2,
            ..Default::default()
        });

        h.engine
            .record_failure(&Target::new("1.1.1.1", "alice"), FailedAttempt::default())
            .await
            .unwrap();
        h.engine
            .record_failure(&Target::new("2.2.2.2", "alice"), FailedAttempt::default())
            .await
            .unwrap();

        // Same subject from any IP is blocked
        assert!(
            h.engine.is_blocked(&Target::new("3.3.3.3", "alice")).await.unwrap()
        );
        assert!(
            !h.engine.is_blocked(&Target::new("1.1.1.1", "bob")).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_context_separates_identifiers() {
        let h = harness(scenario_config());
        let tenant_a = alice().with_context(&json!({"tenant": "a"})).unwrap();
        let tenant_b = alice().with_context(&json!({"tenant": "b"})).unwrap();

        for _ in 0..3 {
            h.engine
                .record_failure(&tenant_a, FailedAttempt::default())
                .await
                .unwrap();
        }

        assert!(h.engine.is_blocked(&tenant_a).await.unwrap());
        assert!(!h.engine.is_blocked(&tenant_b).await.unwrap());
    }

    #[tokio::test]
    async fn test_device_id_and_timestamp_on_event() {
        let h = harness(GuardConfig::default());
        let at = h.clock.now() - chrono::Duration::seconds(2);

        h.engine
            .record_failure(
                &alice(),
                FailedAttempt::default().at(at).with_device_id("device-7"),
            )
            .await
            .unwrap();

        let events = h.sink.events.lock().unwrap();
        assert_eq!(events[0].timestamp, at);
        assert_eq!(events[0].meta["device_id"], json!("device-7"));
    }

    #[tokio::test]
    async fn test_cleanup_emits_single_event_without_count() {
        let h = harness(GuardConfig::default());
        let swept = h.engine.cleanup().await.unwrap();

        assert_eq!(swept, 0);
        assert_eq!(h.sink.actions(), vec![SecurityAction::Cleanup]);
        let events = h.sink.events.lock().unwrap();
        assert!(events[0].meta.is_empty());
        assert!(events[0].ip.is_none());
    }

    #[tokio::test]
    async fn test_stats_passthrough() {
        let h = harness(scenario_config());
        for _ in 0..3 {
            h.engine
                .record_failure(&alice(), FailedAttempt::default())
                .await
                .unwrap();
        }

        let stats = h.engine.get_stats().await.unwrap();
        assert_eq!(stats["active_blocks"], 1);
        assert_eq!(stats["tracked_identifiers"], 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_open_one_block() {
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(
            GuardEngine::new(
                Arc::new(MemoryGuardStorage::new()),
                GuardConfig {
                    max_failures: 5,
                    ..Default::default()
                },
            )
            .unwrap()
            .with_event_sink(sink.clone()),
        );

        let k = 40;
        let mut handles = Vec::new();
        for _ in 0..k {
            let engine = engine.clone();
            handles.push(tokio::spawn(async move {
                engine
                    .record_failure(&alice(), FailedAttempt::default())
                    .await
                    .unwrap()
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();

        assert_eq!(counts, (1..=k).collect::<Vec<u32>>());
        assert_eq!(sink.count(SecurityAction::BlockCreated), 1);

        let identifier = engine.identifier_for(&alice()).unwrap();
        let backoff = engine
            .storage()
            .get_backoff_state(&identifier)
            .await
            .unwrap();
        assert_eq!(backoff.consecutive_blocks, 1);
    }

    /// A backend that is down.
    struct UnavailableStorage;

    #[async_trait]
    impl GuardStorage for UnavailableStorage {
        async fn increment_failure(&self, _: &Identifier, _: Duration) -> Result<u32, Error> {
            Err(StorageError::Connection("connection refused".into()).into())
        }
        async fn reset_failure(&self, _: &Identifier) -> Result<(), Error> {
            Err(StorageError::Connection("connection refused".into()).into())
        }
        async fn get_active_block(&self, _: &Identifier) -> Result<Option<SecurityBlock>, Error> {
            Err(StorageError::Connection("connection refused".into()).into())
        }
        async fn write_block(&self, _: &SecurityBlock) -> Result<(), Error> {
            Err(StorageError::Connection("connection refused".into()).into())
        }
        async fn delete_block(&self, _: &Identifier) -> Result<(), Error> {
            Err(StorageError::Connection("connection refused".into()).into())
        }
        async fn get_backoff_state(&self, _: &Identifier) -> Result<BackoffState, Error> {
            Err(StorageError::Connection("connection refused".into()).into())
        }
        async fn set_backoff_state(&self, _: &BackoffState) -> Result<(), Error> {
            Err(StorageError::Connection("connection refused".into()).into())
        }
        async fn sweep_expired(&self) -> Result<u64, Error> {
            Err(StorageError::Connection("connection refused".into()).into())
        }
        async fn stats(&self) -> Result<BTreeMap<String, u64>, Error> {
            Err(StorageError::Connection("connection refused".into()).into())
        }
    }

    #[tokio::test]
    async fn test_storage_errors_propagate_without_events() {
        let sink = Arc::new(RecordingSink::default());
        let engine = GuardEngine::new(Arc::new(UnavailableStorage), GuardConfig::default())
            .unwrap()
            .with_event_sink(sink.clone());

        let err = engine
            .record_failure(&alice(), FailedAttempt::default())
            .await
            .unwrap_err();
        assert!(err.is_storage_error());
        assert!(
            engine.is_blocked(&alice()).await.unwrap_err().is_storage_error()
        );
        assert!(
            engine.unblock(&alice()).await.unwrap_err().is_storage_error()
        );
        assert!(engine.cleanup().await.unwrap_err().is_storage_error());

        assert!(sink.actions().is_empty());
    }

    /// A backend that never answers.
    struct StalledStorage;

    #[async_trait]
    impl GuardStorage for StalledStorage {
        async fn increment_failure(&self, _: &Identifier, _: Duration) -> Result<u32, Error> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(1)
        }
        async fn reset_failure(&self, _: &Identifier) -> Result<(), Error> {
            Ok(())
        }
        async fn get_active_block(&self, _: &Identifier) -> Result<Option<SecurityBlock>, Error> {
            Ok(None)
        }
        async fn write_block(&self, _: &SecurityBlock) -> Result<(), Error> {
            Ok(())
        }
        async fn delete_block(&self, _: &Identifier) -> Result<(), Error> {
            Ok(())
        }
        async fn get_backoff_state(&self, identifier: &Identifier) -> Result<BackoffState, Error> {
            Ok(BackoffState::new(identifier.clone()))
        }
        async fn set_backoff_state(&self, _: &BackoffState) -> Result<(), Error> {
            Ok(())
        }
        async fn sweep_expired(&self) -> Result<u64, Error> {
            Ok(0)
        }
        async fn stats(&self) -> Result<BTreeMap<String, u64>, Error> {
            Ok(BTreeMap::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_deadline_surfaces_timeout() {
        let sink = Arc::new(RecordingSink::default());
        let engine = GuardEngine::new(
            Arc::new(StalledStorage),
            GuardConfig {
                operation_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .unwrap()
        .with_event_sink(sink.clone());

        let err = engine
            .record_failure(&alice(), FailedAttempt::default())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(sink.actions().is_empty());
    }
}
