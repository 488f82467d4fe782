//! # Portcullis
//!
//! Portcullis protects login endpoints against brute-force and
//! credential-stuffing attacks. Report each failed login and it counts
//! failures per identifier inside a sliding window, blocks the identifier
//! once a threshold is reached, and escalates the block length for repeat
//! offenders.
//!
//! It does not check credentials. Ask [`Portcullis::is_blocked`] before
//! verifying a password and call [`Portcullis::record_failure`] when the
//! verification fails.
//!
//! ## Storage Support
//!
//! - In process memory
//! - SQLite (`sqlite` feature, on by default)
//! - Postgres (`postgres` feature)
//! - Any type implementing [`GuardStorage`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use portcullis::{FailedAttempt, PortcullisBuilder, Target};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let guard = PortcullisBuilder::new()
//!         .with_sqlite("sqlite://guard.db")
//!         .await?
//!         .apply_migrations(true)
//!         .build()
//!         .await?;
//!
//!     let target = Target::new("203.0.113.7", "alice@example.com");
//!     if let Some(seconds) = guard.get_remaining_block_seconds(&target).await? {
//!         println!("try again in {seconds}s");
//!         return Ok(());
//!     }
//!
//!     // password check failed
//!     guard.record_failure(&target, FailedAttempt::default()).await?;
//!     Ok(())
//! }
//! ```
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};

mod builder;

pub use builder::{NoStorage, PortcullisBuilder, PortcullisBuilderError, WithStorage};

/// Re-export core types from portcullis_core
pub use portcullis_core::{
    BackoffState, BlockLength, BlockRequest, BlockType, Clock, ConfigError, Context, Error,
    EventBus, EventError, EventHandler, EventSink, FailedAttempt, GuardConfig, GuardEngine,
    GuardStorage, Identifier, IdentifierMode, IdentifierStrategy, LoggingEventHandler,
    ManualClock, MemoryGuardStorage, NoopEventSink, Platform, SecurityAction, SecurityBlock,
    SecurityEvent, StorageError, SystemClock, Target,
};

/// Re-export the SQLite backend
#[cfg(feature = "sqlite")]
pub mod sqlite {
    pub use portcullis_storage_sqlite::SqliteGuardStorage;
}

/// Re-export the Postgres backend
#[cfg(feature = "postgres")]
pub mod postgres {
    pub use portcullis_storage_postgres::PostgresGuardStorage;
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteGuardStorage;

#[cfg(feature = "postgres")]
pub use postgres::PostgresGuardStorage;

const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Backends that own a schema.
#[async_trait]
pub(crate) trait Migrate: Send + Sync {
    async fn migrate(&self) -> Result<(), Error>;
}

#[cfg(feature = "sqlite")]
#[async_trait]
impl Migrate for SqliteGuardStorage {
    async fn migrate(&self) -> Result<(), Error> {
        SqliteGuardStorage::migrate(self).await
    }
}

#[cfg(feature = "postgres")]
#[async_trait]
impl Migrate for PostgresGuardStorage {
    async fn migrate(&self) -> Result<(), Error> {
        PostgresGuardStorage::migrate(self).await
    }
}

/// The guard, shared across request handlers.
///
/// Cheap to clone; all clones drive the same engine and backend.
#[derive(Clone)]
pub struct Portcullis {
    engine: Arc<GuardEngine<dyn GuardStorage>>,
    migrator: Option<Arc<dyn Migrate>>,
}

impl Portcullis {
    /// Wrap a backend with default settings. Use [`PortcullisBuilder`] for
    /// anything else.
    pub fn new(storage: Arc<dyn GuardStorage>, config: GuardConfig) -> Result<Self, Error> {
        Ok(Self::from_parts(
            Arc::new(GuardEngine::new(storage, config)?),
            None,
        ))
    }

    pub fn builder() -> PortcullisBuilder<NoStorage> {
        PortcullisBuilder::new()
    }

    pub(crate) fn from_parts(
        engine: Arc<GuardEngine<dyn GuardStorage>>,
        migrator: Option<Arc<dyn Migrate>>,
    ) -> Self {
        Self { engine, migrator }
    }

    pub fn engine(&self) -> &GuardEngine<dyn GuardStorage> {
        &self.engine
    }

    pub fn config(&self) -> &GuardConfig {
        self.engine.config()
    }

    /// Create or upgrade the backend schema. A no-op for backends without one.
    pub async fn migrate(&self) -> Result<(), Error> {
        match &self.migrator {
            Some(migrator) => migrator.migrate().await,
            None => Ok(()),
        }
    }

    pub async fn health_check(&self) -> Result<(), Error> {
        self.engine.health_check().await
    }

    /// See [`GuardEngine::record_failure`].
    pub async fn record_failure(
        &self,
        target: &Target,
        attempt: FailedAttempt,
    ) -> Result<u32, Error> {
        self.engine.record_failure(target, attempt).await
    }

    /// See [`GuardEngine::reset_attempts`].
    pub async fn reset_attempts(&self, target: &Target) -> Result<(), Error> {
        self.engine.reset_attempts(target).await
    }

    pub async fn is_blocked(&self, target: &Target) -> Result<bool, Error> {
        self.engine.is_blocked(target).await
    }

    pub async fn get_active_block(&self, target: &Target) -> Result<Option<SecurityBlock>, Error> {
        self.engine.get_active_block(target).await
    }

    pub async fn get_remaining_block_seconds(&self, target: &Target) -> Result<Option<u64>, Error> {
        self.engine.get_remaining_block_seconds(target).await
    }

    /// See [`GuardEngine::block`].
    pub async fn block(
        &self,
        target: &Target,
        request: BlockRequest,
    ) -> Result<SecurityBlock, Error> {
        self.engine.block(target, request).await
    }

    /// See [`GuardEngine::unblock`].
    pub async fn unblock(&self, target: &Target) -> Result<bool, Error> {
        self.engine.unblock(target).await
    }

    pub async fn cleanup(&self) -> Result<u64, Error> {
        self.engine.cleanup().await
    }

    pub async fn get_stats(&self) -> Result<BTreeMap<String, u64>, Error> {
        self.engine.get_stats().await
    }

    pub fn identifier_for(&self, target: &Target) -> Result<Identifier, Error> {
        self.engine.identifier_for(target)
    }

    /// Run [`cleanup`](Self::cleanup) every `interval` until `shutdown`
    /// changes or its sender is dropped.
    ///
    /// The first sweep runs immediately. Failures are logged and the timer
    /// keeps going. An `interval` shorter than one second is raised to one
    /// second.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use std::time::Duration;
    /// # async fn example(guard: portcullis::Portcullis) {
    /// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    /// let handle = guard.spawn_cleanup_task(Duration::from_secs(3600), shutdown_rx);
    ///
    /// // on shutdown
    /// let _ = shutdown_tx.send(true);
    /// let _ = handle.await;
    /// # }
    /// ```
    pub fn spawn_cleanup_task(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(&self.engine);
        if interval < MIN_CLEANUP_INTERVAL {
            tracing::warn!(
                requested = ?interval,
                using = ?MIN_CLEANUP_INTERVAL,
                "Cleanup interval too short, clamping"
            );
        }
        let interval = interval.max(MIN_CLEANUP_INTERVAL);

        tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval_timer.tick() => {
                        if let Err(e) = engine.cleanup().await {
                            tracing::warn!(error = %e, "Failed to sweep expired guard records");
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::info!("Shutting down guard cleanup task");
                        break;
                    }
                }
            }
        })
    }
}
