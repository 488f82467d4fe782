//! Postgres storage backend for the portcullis login guard.
//!
//! Uses the same three-table layout as the SQLite backend with `TIMESTAMPTZ`
//! expiry columns. Counter increments are single upserts; opening an
//! automatic block locks the identifier's backoff row with `FOR UPDATE` so
//! concurrent engines open at most one block per threshold crossing.

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
use sqlx::{PgPool, postgres::PgPoolOptions};

pub struct PostgresGuardStorage {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    swept_total: AtomicU64,
}

impl PostgresGuardStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
            swept_total: AtomicU64::new(0),
        }
    }

    pub async fn connect(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Failed to connect to Postgres");
                StorageError::Connection(e.to_string())
            })?;

        Ok(Self::new(pool))
    }

    /// Judge expiry by `clock` instead of wall-clock time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
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
}

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

fn to_u32(value: i32) -> u32 {
    u32::try_from(value).unwrap_or(0)
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn window_end(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_add_signed(w))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Internal struct for block rows
#[derive(Debug, sqlx::FromRow)]
struct PostgresBlock {
    identifier: String,
    block_type: String,
    blocked_at: DateTime<Utc>,
    blocked_until: DateTime<Utc>,
}

impl PostgresBlock {
    fn into_block(self) -> Option<SecurityBlock> {
        match BlockType::from_str(&self.block_type) {
            Ok(block_type) => Some(SecurityBlock {
                identifier: Identifier::new(self.identifier),
                block_type,
                blocked_at: self.blocked_at,
                blocked_until: self.blocked_until,
            }),
            Err(e) => {
                tracing::warn!(
                    identifier = %self.identifier,
                    error = %e,
                    "Ignoring malformed block record"
                );
                None
            }
        }
    }
}

const UPSERT_BLOCK: &str = r#"
    INSERT INTO guard_blocks (identifier, block_type, blocked_at, blocked_until)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (identifier) DO UPDATE SET
        block_type = EXCLUDED.block_type,
        blocked_at = EXCLUDED.blocked_at,
        blocked_until = EXCLUDED.blocked_until
"#;

#[async_trait]
impl GuardStorage for PostgresGuardStorage {
    async fn increment_failure(
        &self,
        identifier: &Identifier,
        window: Duration,
    ) -> Result<u32, Error> {
        let now = self.clock.now();

        let count: i32 = sqlx::query_scalar(
            r#"
            INSERT INTO guard_failures (identifier, count, window_expires_at)
            VALUES ($1, 1, $2)
            ON CONFLICT (identifier) DO UPDATE SET
                count = CASE WHEN guard_failures.window_expires_at > $3
                    THEN guard_failures.count + 1 ELSE 1 END,
                window_expires_at = CASE WHEN guard_failures.window_expires_at > $3
                    THEN guard_failures.window_expires_at ELSE EXCLUDED.window_expires_at END
            RETURNING count
            "#,
        )
        .bind(identifier.as_str())
        .bind(window_end(now, window))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to increment failure counter"))?;

        Ok(to_u32(count))
    }

    async fn reset_failure(&self, identifier: &Identifier) -> Result<(), Error> {
        sqlx::query("DELETE FROM guard_failures WHERE identifier = $1")
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
        let row = sqlx::query_as::<_, PostgresBlock>(
            r#"
            SELECT identifier, block_type, blocked_at, blocked_until
            FROM guard_blocks
            WHERE identifier = $1 AND blocked_until > $2
            "#,
        )
        .bind(identifier.as_str())
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get block"))?;

        Ok(row.and_then(PostgresBlock::into_block))
    }

    async fn write_block(&self, block: &SecurityBlock) -> Result<(), Error> {
        sqlx::query(UPSERT_BLOCK)
            .bind(block.identifier.as_str())
            .bind(block.block_type.as_str())
            .bind(block.blocked_at)
            .bind(block.blocked_until)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to write block"))?;

        Ok(())
    }

    async fn delete_block(&self, identifier: &Identifier) -> Result<(), Error> {
        sqlx::query("DELETE FROM guard_blocks WHERE identifier = $1")
            .bind(identifier.as_str())
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to delete block"))?;

        Ok(())
    }

    async fn get_backoff_state(&self, identifier: &Identifier) -> Result<BackoffState, Error> {
        let consecutive: Option<i32> = sqlx::query_scalar(
            "SELECT consecutive_blocks FROM guard_backoff WHERE identifier = $1",
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
            VALUES ($1, $2, $3)
            ON CONFLICT (identifier) DO UPDATE SET
                consecutive_blocks = EXCLUDED.consecutive_blocks,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(state.identifier.as_str())
        .bind(to_i32(state.consecutive_blocks))
        .bind(self.clock.now())
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

        sqlx::query(
            r#"
            INSERT INTO guard_backoff (identifier, consecutive_blocks, updated_at)
            VALUES ($1, 0, $2)
            ON CONFLICT (identifier) DO NOTHING
            "#,
        )
        .bind(identifier.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to prepare backoff state"))?;

        // The row lock serializes callers for this identifier until commit
        let consecutive: i32 = sqlx::query_scalar(
            "SELECT consecutive_blocks FROM guard_backoff WHERE identifier = $1 FOR UPDATE",
        )
        .bind(identifier.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("Failed to lock backoff state"))?;

        let active: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT blocked_until FROM guard_blocks WHERE identifier = $1 AND blocked_until > $2",
        )
        .bind(identifier.as_str())
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to check active block"))?;

        if active.is_some() {
            tx.rollback()
                .await
                .map_err(db_error("Failed to roll back transaction"))?;
            return Ok(None);
        }

        let block = auto_block(identifier, policy, to_u32(consecutive), now);

        sqlx::query(UPSERT_BLOCK)
            .bind(identifier.as_str())
            .bind(block.block_type.as_str())
            .bind(block.blocked_at)
            .bind(block.blocked_until)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to write block"))?;

        sqlx::query(
            r#"
            UPDATE guard_backoff
            SET consecutive_blocks = consecutive_blocks + 1, updated_at = $2
            WHERE identifier = $1
            "#,
        )
        .bind(identifier.as_str())
        .bind(now)
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
            sqlx::query(&format!("DELETE FROM {table} WHERE identifier = $1"))
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
        let now = self.clock.now();

        let failures = sqlx::query("DELETE FROM guard_failures WHERE window_expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to sweep failure counters"))?;

        let blocks = sqlx::query("DELETE FROM guard_blocks WHERE blocked_until <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to sweep blocks"))?;

        let swept = failures.rows_affected() + blocks.rows_affected();
        self.swept_total.fetch_add(swept, Ordering::Relaxed);

        Ok(swept)
    }

    async fn stats(&self) -> Result<BTreeMap<String, u64>, Error> {
        let (active_blocks, tracked, backoff): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM guard_blocks WHERE blocked_until > $1),
                (SELECT COUNT(*) FROM guard_failures WHERE window_expires_at > $1),
                (SELECT COUNT(*) FROM guard_backoff WHERE consecutive_blocks > 0)
            "#,
        )
        .bind(self.clock.now())
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
