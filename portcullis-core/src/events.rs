use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::EventError;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityAction {
    /// A failed login was recorded. Emitted for every failure.
    LoginAttempt,
    /// A block was placed, automatically or on request.
    BlockCreated,
    /// An identifier was unblocked and its backoff reset.
    BlockRemoved,
    /// A maintenance sweep ran.
    Cleanup,
}

impl SecurityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityAction::LoginAttempt => "login_attempt",
            SecurityAction::BlockCreated => "block_created",
            SecurityAction::BlockRemoved => "block_removed",
            SecurityAction::Cleanup => "cleanup",
        }
    }
}

/// The surface the guarded login endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[default]
    Web,
    Api,
    Mobile,
    Cli,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Web => "web",
            Platform::Api => "api",
            Platform::Mobile => "mobile",
            Platform::Cli => "cli",
        }
    }
}

/// A notification about a guard state transition.
///
/// Events are built by the engine after the storage mutation they describe
/// has succeeded. The engine never persists them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub action: SecurityAction,
    pub platform: Platform,
    pub timestamp: DateTime<Utc>,
    /// Client IP, absent for global events such as cleanup
    pub ip: Option<String>,
    /// Login subject, absent for global events such as cleanup
    pub subject: Option<String>,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl SecurityEvent {
    pub fn new(action: SecurityAction, platform: Platform, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            platform,
            timestamp,
            ip: None,
            subject: None,
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_origin(mut self, ip: impl Into<String>, subject: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self.subject = Some(subject.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }
}

/// Receives every event the engine produces.
///
/// `dispatch` has no error channel: an implementation must absorb its own
/// delivery failures. The engine awaits it, so a slow sink slows the caller.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn dispatch(&self, event: &SecurityEvent);
}

/// Sink used when no notifications are wanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn dispatch(&self, _event: &SecurityEvent) {}
}

/// A single consumer registered on an [`EventBus`].
///
/// # Examples
///
/// ```
/// # use portcullis_core::events::{EventHandler, SecurityEvent};
/// # use portcullis_core::error::EventError;
/// # use async_trait::async_trait;
/// struct AlertOnBlock;
///
/// #[async_trait]
/// impl EventHandler for AlertOnBlock {
///     async fn handle_event(&self, event: &SecurityEvent) -> Result<(), EventError> {
///         // page someone...
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle_event(&self, event: &SecurityEvent) -> Result<(), EventError>;
}

/// Fans events out to registered handlers in registration order.
///
/// A failing or timed-out handler is logged and skipped; the remaining
/// handlers still receive the event.
///
/// ```
/// # use std::sync::Arc;
/// # use portcullis_core::events::{EventBus, LoggingEventHandler};
/// # async fn example() {
/// let bus = EventBus::new();
/// bus.register(Arc::new(LoggingEventHandler)).await;
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    handler_timeout: Option<Duration>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(Vec::new())),
            handler_timeout: None,
        }
    }

    /// Bound how long a single handler may take per event.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        self.handlers.write().await.push(handler);
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }

    async fn deliver(
        &self,
        handler: &dyn EventHandler,
        event: &SecurityEvent,
    ) -> Result<(), EventError> {
        match self.handler_timeout {
            Some(limit) => tokio::time::timeout(limit, handler.handle_event(event))
                .await
                .map_err(|_| EventError::Timeout(limit))?,
            None => handler.handle_event(event).await,
        }
    }
}

#[async_trait]
impl EventSink for EventBus {
    async fn dispatch(&self, event: &SecurityEvent) {
        let handlers = self.handlers.read().await.clone();
        for handler in handlers {
            if let Err(e) = self.deliver(handler.as_ref(), event).await {
                tracing::warn!(
                    error = %e,
                    event_id = %event.id,
                    action = event.action.as_str(),
                    "Dropped security event after handler failure"
                );
            }
        }
    }
}

/// Writes every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    async fn handle_event(&self, event: &SecurityEvent) -> Result<(), EventError> {
        let meta = serde_json::Value::Object(event.meta.clone());
        match event.action {
            SecurityAction::BlockCreated => tracing::warn!(
                event_id = %event.id,
                action = event.action.as_str(),
                platform = event.platform.as_str(),
                ip = event.ip.as_deref(),
                subject = event.subject.as_deref(),
                meta = %meta,
                "Security event"
            ),
            SecurityAction::LoginAttempt
            | SecurityAction::BlockRemoved
            | SecurityAction::Cleanup => tracing::info!(
                event_id = %event.id,
                action = event.action.as_str(),
                platform = event.platform.as_str(),
                ip = event.ip.as_deref(),
                subject = event.subject.as_deref(),
                meta = %meta,
                "Security event"
            ),
        }
        Ok(())
    }
}
