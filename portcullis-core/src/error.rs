use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Storage unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Backend failures. Every variant is surfaced to the caller of the engine
/// operation that triggered it and is never retried internally.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Migration error: {0}")]
    Migration(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Invalid context: {0}")]
    InvalidContext(String),
}

/// Notification failures. These never escape an [`EventSink`](crate::events::EventSink).
#[derive(Debug, Error)]
pub enum EventError {
    #[error("Event delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Event handler timed out after {0:?}")]
    Timeout(Duration),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

impl Error {
    pub fn is_storage_error(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Storage(StorageError::Timeout(_)))
    }
}
