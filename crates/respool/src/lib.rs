//! respool: a bounded async pool of expensive resources.
//!
//! A pool hands out resources made by a [`Manager`], reusing idle ones first
//! and failing fast with [`PoolError::PoolFull`] once `max_count` resources
//! are live. Building a pool yields two handles:
//!
//! - [`PoolHandle`]: acquire and release, optionally with retry layers.
//! - [`Administration`]: counts, status and idle eviction.
//!
//! Neither handle can be turned into the other.

mod admin;
mod builder;
mod config;
mod error;
mod manager;
mod pool;
mod retry;
mod store;

pub use admin::{Administration, EvictionReport, IdlePredicate, IdleTime, PoolStatus};
pub use builder::{PoolBuilder, create_pool};
pub use config::{
    ENV_MAX_COUNT, ENV_MIN_COUNT, ENV_RETRY_COUNT, ENV_RETRY_WAIT_MS, PoolConfig, RetryConfig,
};
pub use error::{ConfigError, DestroyError, PoolError};
pub use manager::{FnManager, Manager};
pub use pool::{Equality, Pool, PoolId};
pub use retry::{BackoffFn, PoolHandle, RetryPolicy, RetryPool, RetryableFn};

/// Crate version from Cargo.toml.
pub const RESPOOL_VERSION: &str = env!("CARGO_PKG_VERSION");
