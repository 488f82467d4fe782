//! Service layer for guard logic
//!
//! Services sit on top of a [`GuardStorage`](crate::storage::GuardStorage)
//! and hold no per-identifier state of their own.

pub mod guard;

pub use guard::{BlockLength, BlockRequest, FailedAttempt, GuardEngine};
