#![allow(clippy::result_large_err)]
//! # Tickq Core
//!
//! A chronological work-claiming queue over a transactional key-value store.
//!
//! ## Architecture
//!
//! - **Queue**: scheduling, owner/type indexes, claim protocol, consumption loop
//!   and a debug pagination view, all coordinated through optimistic transactions
//! - **Store**: the store contract with a Redis backend and an in-memory backend
//! - **Telemetry**: structured logging and Prometheus metrics
//! - **Config**: file and environment driven configuration

pub mod config;
pub mod error;
pub mod queue;
pub mod store;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, QueueError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, QueueConfig, RedisConfig};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, QueueError, Result};
    pub use crate::queue::{
        Claim, ClaimDescriptor, Delivery, EntryKey, Items, JobId, OwnerScope, QueueStats,
        ScheduleRequest, ScheduledItem, ScheduledQueue,
    };
    pub use crate::store::{MemoryStore, RedisStore, Store};
}
