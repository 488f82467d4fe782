//! SQLite storage backend for the portcullis login guard.
//!
//! State lives in three tables (`guard_failures`, `guard_blocks`,
//! `guard_backoff`) with explicit expiry columns holding unix milliseconds.
//! Every read filters on those columns, so expired rows are invisible long
//! before [`GuardStorage::sweep_expired`] deletes them.
//!
//! ```rust,no_run
//! use portcullis_storage_sqlite::SqliteGuardStorage;
//!
//! # async fn example() -> Result<(), portcullis_core::Error> {
//! let storage = SqliteGuardStorage::connect("sqlite://guard.db").await?;
//! storage.migrate().await?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::BTreeMap,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use portcullis_core::{
    Error,
    block::{BackoffState, BlockType, SecurityBlock},
    clock::{Clock, SystemClock},
    config::LockoutPolicy,
    error::StorageError,
    identifier::Identifier,
    storage::{GuardStorage, auto_block, stat},
};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

pub struct SqliteGuardStorage {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    swept_total: AtomicU64,
}

impl SqliteGuardStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            swept_total: AtomicU64::new(0),
        }
    }

    /// Open a pool for `url`, creating the database file if needed.
    ///
    /// An in-memory database is private to the connection that opened it, so
    /// `sqlite::memory:` gets a single-connection pool.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to SQLite");
                StorageError::Connection(e.to_string())
            })?;

        Ok(Self::new(pool))
    }

    /// Judge expiry by `clock` instead of wall-clock time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create or upgrade the guard tables.
    ///
    /// Applied versions are recorded in `_sqlx_migrations`, so running this
    /// again is a no-op.
    pub async fn migrate(&self) -> Result<(), Error> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to apply migrations");
                StorageError::Migration(e.to_string())
            })?;
        Ok(())
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }
}

/// Log a driver error and classify it.
fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| {
        tracing::error!(error = %e, "{context}");
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StorageError::Connection(context.to_string()).into()
            }
            _ => StorageError::Database(context.to_string()).into(),
        }
    }
}

fn millis(value: Duration) -> i64 {
    i64::try_from(value.as_millis()).unwrap_or(i64::MAX)
}

fn to_u32(value: i64) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(u32::MAX)
}

/// Internal struct for block rows
#[derive(Debug, sqlx::FromRow)]
struct SqliteBlock {
    identifier: String,
    block_type: String,
    blocked_at: i64,
    blocked_until: i64,
}

impl SqliteBlock {
    /// `None` for rows that do not decode.
    fn into_block(self) -> Option<SecurityBlock> {
        let block_type = BlockType::from_str(&self.block_type);
        let blocked_at = DateTime::from_timestamp_millis(self.blocked_at);
        let blocked_until = DateTime::from_timestamp_millis(self.blocked_until);

        match (block_type, blocked_at, blocked_until) {
            (Ok(block_type), Some(blocked_at), Some(blocked_until)) => Some(SecurityBlock {
                identifier: Identifier::new(self.identifier),
                block_type,
                blocked_at,
                blocked_until,
            }),
            _ => {
                tracing::warn!(
                    identifier = %self.identifier,
                    block_type = %self.block_type,
                    "Ignoring malformed block record"
                );
                None
            }
        }
    }
}

const UPSERT_BLOCK: &str = r#"
    INSERT INTO guard_blocks (identifier, block_type, blocked_at, blocked_until)
    VALUES (?, ?, ?, ?)
    ON CONFLICT(identifier) DO UPDATE SET
        block_type = excluded.block_type,
        blocked_at = excluded.blocked_at,
        blocked_until = excluded.blocked_until
"#;

#[async_trait]
impl GuardStorage for SqliteGuardStorage {
    async fn increment_failure(
        &self,
        identifier: &Identifier,
        window: Duration,
    ) -> Result<u32, Error> {
        let now = self.now_millis();

        // Assignments in DO UPDATE all see the pre-update row, so a lapsed
        // window restarts at 1 with a fresh expiry in the same statement.
        let count: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO guard_failures (identifier, count, window_expires_at)
            VALUES (?1, 1, ?2)
            ON CONFLICT(identifier) DO UPDATE SET
                count = CASE WHEN guard_failures.window_expires_at > ?3
                    THEN guard_failures.count + 1 ELSE 1 END,
                window_expires_at = CASE WHEN guard_failures.window_expires_at > ?3
                    THEN guard_failures.window_expires_at ELSE excluded.window_expires_at END
            RETURNING count
            "#,
        )
        .bind(identifier.as_str())
        .bind(now.saturating_add(millis(window)))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to increment failure counter"))?;

        Ok(to_u32(count))
    }

    async fn reset_failure(&self, identifier: &Identifier) -> Result<(), Error> {
        sqlx::query("DELETE FROM guard_failures WHERE identifier = ?")
            .bind(identifier.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to reset failure counter"))?;

        Ok(())
    }

    async fn get_active_block(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<SecurityBlock>, Error> {
        let row = sqlx::query_as::<_, SqliteBlock>(
            r#"
            SELECT identifier, block_type, blocked_at, blocked_until
            FROM guard_blocks
            WHERE identifier = ? AND blocked_until > ?
            "#,
        )
        .bind(identifier.as_str())
        .bind(self.now_millis())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get block"))?;

        Ok(row.and_then(SqliteBlock::into_block))
    }

    async fn write_block(&self, block: &SecurityBlock) -> Result<(), Error> {
        sqlx::query(UPSERT_BLOCK)
            .bind(block.identifier.as_str())
            .bind(block.block_type.as_str())
            .bind(block.blocked_at.timestamp_millis())
            .bind(block.blocked_until.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to write block"))?;

        Ok(())
    }

    async fn delete_block(&self, identifier: &Identifier) -> Result<(), Error> {
        sqlx::query("DELETE FROM guard_blocks WHERE identifier = ?")
            .bind(identifier.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to delete block"))?;

        Ok(())
    }

    async fn get_backoff_state(&self, identifier: &Identifier) -> Result<BackoffState, Error> {
        let consecutive: Option<i64> = sqlx::query_scalar(
            "SELECT consecutive_blocks FROM guard_backoff WHERE identifier = ?",
        )
        .bind(identifier.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get backoff state"))?;

        Ok(BackoffState {
            identifier: identifier.clone(),
            consecutive_blocks: consecutive.map(to_u32).unwrap_or(0),
        })
    }

    async fn set_backoff_state(&self, state: &BackoffState) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO guard_backoff (identifier, consecutive_blocks, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(identifier) DO UPDATE SET
                consecutive_blocks = excluded.consecutive_blocks,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(state.identifier.as_str())
        .bind(i64::from(state.consecutive_blocks))
        .bind(self.now_millis())
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to set backoff state"))?;

        Ok(())
    }

    async fn open_auto_block(
        &self,
        identifier: &Identifier,
        policy: &LockoutPolicy,
        _now: DateTime<Utc>,
    ) -> Result<Option<SecurityBlock>, Error> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        // Writing first takes the database write lock for the whole
        // transaction, so concurrent callers queue here instead of racing
        // between the block check and the insert.
        sqlx::query(
            r#"
            INSERT INTO guard_backoff (identifier, consecutive_blocks, updated_at)
            VALUES (?, 0, ?)
            ON CONFLICT(identifier) DO NOTHING
            "#,
        )
        .bind(identifier.as_str())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to lock backoff state"))?;

        let active: Option<i64> = sqlx::query_scalar(
            "SELECT blocked_until FROM guard_blocks WHERE identifier = ? AND blocked_until > ?",
        )
        .bind(identifier.as_str())
        .bind(now.timestamp_millis())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to check active block"))?;

        if active.is_some() {
            tx.rollback()
                .await
                .map_err(db_error("Failed to roll back transaction"))?;
            return Ok(None);
        }

        let consecutive: i64 = sqlx::query_scalar(
            "SELECT consecutive_blocks FROM guard_backoff WHERE identifier = ?",
        )
        .bind(identifier.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to get backoff state"))?;

        let block = auto_block(identifier, policy, to_u32(consecutive), now);

        sqlx::query(UPSERT_BLOCK)
            .bind(identifier.as_str())
            .bind(block.block_type.as_str())
            .bind(block.blocked_at.timestamp_millis())
            .bind(block.blocked_until.timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to write block"))?;

        sqlx::query(
            r#"
            UPDATE guard_backoff
            SET consecutive_blocks = consecutive_blocks + 1, updated_at = ?
            WHERE identifier = ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(identifier.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to escalate backoff state"))?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit auto block"))?;

        Ok(Some(block))
    }

    async fn clear(&self, identifier: &Identifier) -> Result<(), Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        for table in ["guard_blocks", "guard_failures", "guard_backoff"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE identifier = ?"))
                .bind(identifier.as_str())
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to clear guard state"))?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit clear"))?;

        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, Error> {
        let now = self.now_millis();

        let failures = sqlx::query("DELETE FROM guard_failures WHERE window_expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to sweep failure counters"))?;

        let blocks = sqlx::query("DELETE FROM guard_blocks WHERE blocked_until <= ?")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to sweep blocks"))?;

        let swept = failures.rows_affected() + blocks.rows_affected();
        self.swept_total.fetch_add(swept, Ordering::Relaxed);

        Ok(swept)
    }

    async fn stats(&self) -> Result<BTreeMap<String, u64>, Error> {
        let now = self.now_millis();

        let (active_blocks, tracked, backoff): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM guard_blocks WHERE blocked_until > ?1),
                (SELECT COUNT(*) FROM guard_failures WHERE window_expires_at > ?1),
                (SELECT COUNT(*) FROM guard_backoff WHERE consecutive_blocks > 0)
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to collect stats"))?;

        Ok(BTreeMap::from([
            (stat::ACTIVE_BLOCKS.to_string(), active_blocks.max(0) as u64),
            (stat::TRACKED_IDENTIFIERS.to_string(), tracked.max(0) as u64),
            (stat::BACKOFF_ENTRIES.to_string(), backoff.max(0) as u64),
            (
                stat::SWEPT_TOTAL.to_string(),
                self.swept_total.load(Ordering::Relaxed),
            ),
        ]))
    }

    async fn health_check(&self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error("Health check failed"))?;
        Ok(())
    }
}
