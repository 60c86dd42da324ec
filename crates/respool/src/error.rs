//! Error types for pool operations.

use std::fmt;

/// Failure of an `acquire` or `release` call.
///
/// `E` is the error type of the pool's [`Manager`](crate::Manager).
#[derive(Debug)]
pub enum PoolError<E> {
    /// Every slot is live and the pool may not grow.
    PoolFull { max_count: usize },

    /// The released resource is not checked out from this pool.
    NotPartOfPool,

    /// The retry policy gave up. `attempts` counts the initial try.
    NoMoreRetriesLeft {
        attempts: u32,
        last: Box<PoolError<E>>,
    },

    /// The manager failed to create a resource.
    Create(E),

    /// The creation task panicked or the runtime shut down under it.
    CreateAborted,
}

// Written by hand: `last` is recursive, which derived bounds can't express.
impl<E: fmt::Display> fmt::Display for PoolError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::PoolFull { max_count } => {
                write!(f, "Pool is full ({max_count} resources)")
            }
            PoolError::NotPartOfPool => f.write_str("Resource is not part of this pool"),
            PoolError::NoMoreRetriesLeft { attempts, last } => {
                write!(f, "No more retries left after {attempts} attempts: {last}")
            }
            PoolError::Create(e) => write!(f, "Failed to create resource: {e}"),
            PoolError::CreateAborted => f.write_str("Resource creation aborted"),
        }
    }
}

impl<E> std::error::Error for PoolError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::NoMoreRetriesLeft { last, .. } => Some(last.as_ref()),
            PoolError::Create(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> PoolError<E> {
    /// The innermost error, looking through exhausted retries.
    pub fn root_cause(&self) -> &PoolError<E> {
        match self {
            PoolError::NoMoreRetriesLeft { last, .. } => last.root_cause(),
            other => other,
        }
    }

    pub fn is_pool_full(&self) -> bool {
        matches!(self.root_cause(), PoolError::PoolFull { .. })
    }

    pub fn is_not_part_of_pool(&self) -> bool {
        matches!(self, PoolError::NotPartOfPool)
    }

    pub fn is_create(&self) -> bool {
        matches!(self.root_cause(), PoolError::Create(_))
    }
}

/// A destroy failure collected during eviction.
#[derive(Debug, thiserror::Error)]
#[error("Failed to destroy resource in slot {slot}: {source}")]
pub struct DestroyError<E> {
    pub slot: usize,
    #[source]
    pub source: E,
}

/// Invalid pool configuration. No pool is produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_count ({max_count}) must be >= min_count ({min_count})")]
    MaxBelowMin { min_count: usize, max_count: usize },

    #[error("invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid pool config: {0}")]
    Parse(String),
}
