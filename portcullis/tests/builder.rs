//! Tests for the Portcullis builder pattern

mod common;

use std::{sync::Arc, time::Duration};

use portcullis::{
    FailedAttempt, GuardConfig, MemoryGuardStorage, PortcullisBuilder, PortcullisBuilderError,
    Target,
};

#[tokio::test]
async fn test_builder_with_memory() {
    common::init_tracing();

    let guard = PortcullisBuilder::new()
        .with_memory()
        .build()
        .await
        .expect("Failed to build Portcullis");

    guard.health_check().await.expect("Health check failed");
    // Nothing to migrate in memory
    guard.migrate().await.expect("Migration failed");
}

#[tokio::test]
async fn test_builder_with_custom_storage() {
    let storage = Arc::new(MemoryGuardStorage::new());
    let guard = PortcullisBuilder::new()
        .with_storage(storage.clone())
        .apply_migrations(true)
        .build()
        .await
        .expect("Failed to build Portcullis");

    let target = Target::new("10.0.0.1", "bob");
    guard
        .record_failure(&target, FailedAttempt::default())
        .await
        .unwrap();

    let stats = guard.get_stats().await.unwrap();
    assert_eq!(stats["tracked_identifiers"], 1);
}

#[tokio::test]
async fn test_builder_rejects_invalid_config() {
    let result = PortcullisBuilder::new()
        .with_config(GuardConfig {
            max_failures: 0,
            ..Default::default()
        })
        .with_memory()
        .build()
        .await;

    assert!(matches!(
        result,
        Err(PortcullisBuilderError::InvalidConfiguration(_))
    ));
}

#[tokio::test]
async fn test_builder_config_reaches_engine() {
    let config = GuardConfig {
        max_failures: 2,
        window: Duration::from_secs(30),
        ..GuardConfig::without_backoff()
    };
    let guard = PortcullisBuilder::new()
        .with_memory()
        .with_config(config.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(guard.config(), &config);

    let target = Target::new("10.0.0.1", "bob");
    for _ in 0..2 {
        guard
            .record_failure(&target, FailedAttempt::default())
            .await
            .unwrap();
    }
    assert!(guard.is_blocked(&target).await.unwrap());
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_builder_with_sqlite() {
    let guard = PortcullisBuilder::new()
        .with_sqlite("sqlite::memory:")
        .await
        .expect("Failed to connect to SQLite")
        .apply_migrations(true)
        .build()
        .await
        .expect("Failed to build Portcullis");

    guard.health_check().await.expect("Health check failed");

    let target = Target::new("10.0.0.1", "bob");
    assert_eq!(
        guard
            .record_failure(&target, FailedAttempt::default())
            .await
            .unwrap(),
        1
    );
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_builder_with_sqlite_pool() {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to connect to SQLite");

    let guard = PortcullisBuilder::new()
        .with_sqlite_pool(pool)
        .apply_migrations(true)
        .build()
        .await
        .expect("Failed to build Portcullis");

    guard.health_check().await.expect("Health check failed");
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_builder_manual_migration() {
    let guard = PortcullisBuilder::new()
        .with_sqlite("sqlite::memory:")
        .await
        .expect("Failed to connect to SQLite")
        .build()
        .await
        .expect("Failed to build Portcullis");

    // Tables do not exist yet
    let target = Target::new("10.0.0.1", "bob");
    let err = guard
        .record_failure(&target, FailedAttempt::default())
        .await
        .unwrap_err();
    assert!(err.is_storage_error());

    guard.migrate().await.expect("Migration failed");
    guard.migrate().await.expect("Migration is idempotent");

    assert_eq!(
        guard
            .record_failure(&target, FailedAttempt::default())
            .await
            .unwrap(),
        1
    );
}

#[cfg(feature = "sqlite")]
#[tokio::test]
async fn test_builder_with_unreachable_sqlite_path() {
    let result = PortcullisBuilder::new()
        .with_sqlite("sqlite:///nonexistent-dir/portcullis/guard.db")
        .await;

    assert!(matches!(
        result,
        Err(PortcullisBuilderError::StorageConnection(_))
    ));
}
