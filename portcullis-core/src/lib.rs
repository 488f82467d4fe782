//! Core functionality for the portcullis project
//!
//! This crate contains the guard engine and everything it is built from:
//! the data model, configuration, identifier derivation, the storage
//! capability, and security events.
//!
//! Storage backends depend on this crate and implement [`GuardStorage`].
//! Application code usually goes through the `portcullis` crate instead,
//! which wires a backend and an engine together.
//!
//! See [`GuardEngine`] for the operations, [`GuardConfig`] for tuning, and
//! [`EventSink`] for receiving notifications.
//!
pub mod block;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod identifier;
pub mod services;
pub mod storage;

pub use block::{BackoffState, BlockType, FailureCounter, SecurityBlock};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{GuardConfig, LockoutPolicy};
pub use error::{ConfigError, Error, EventError, StorageError};
pub use events::{
    EventBus, EventHandler, EventSink, LoggingEventHandler, NoopEventSink, Platform,
    SecurityAction, SecurityEvent,
};
pub use identifier::{Context, Identifier, IdentifierMode, IdentifierStrategy, Target};
pub use services::{BlockLength, BlockRequest, FailedAttempt, GuardEngine};
pub use storage::{GuardStorage, MemoryGuardStorage};
