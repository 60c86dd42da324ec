//! Pool construction.

use std::sync::Arc;

use crate::admin::Administration;
use crate::config::PoolConfig;
use crate::error::ConfigError;
use crate::manager::Manager;
use crate::pool::{Equality, Pool, Shared};
use crate::retry::{PoolHandle, RetryPolicy};

/// Builds a pool and returns its two handles.
///
/// ```no_run
/// # use respool::{FnManager, PoolBuilder, RetryPolicy};
/// # use std::time::Duration;
/// # #[derive(Debug, thiserror::Error)] #[error("x")] struct ConnectError;
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = FnManager::new(
///     || async { Ok::<_, ConnectError>(1u64) },
///     |_conn: u64| async { Ok::<_, ConnectError>(()) },
/// );
/// let (pool, admin) = PoolBuilder::new(manager)
///     .min_count(1)
///     .max_count(8)
///     .retry(RetryPolicy::fixed(3, Duration::from_millis(50)))
///     .build()?;
///
/// let conn = pool.acquire().await?;
/// pool.release(conn)?;
/// admin.run_eviction(Duration::from_secs(30)).await;
/// # Ok(())
/// # }
/// ```
pub struct PoolBuilder<M: Manager> {
    manager: M,
    config: PoolConfig,
    equality: Equality<M::Resource>,
    retry: Option<RetryPolicy<M::Error>>,
}

impl<M> PoolBuilder<M>
where
    M: Manager,
    M::Resource: PartialEq,
{
    /// Released resources are matched with `==`.
    pub fn new(manager: M) -> Self {
        Self::with_equality(manager, |a: &M::Resource, b: &M::Resource| a == b)
    }
}

impl<M: Manager> PoolBuilder<M> {
    /// Released resources are matched with `equality`, which must be an
    /// equivalence relation. It runs with the slot store locked, so it must
    /// not call back into the pool.
    pub fn with_equality(
        manager: M,
        equality: impl Fn(&M::Resource, &M::Resource) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            manager,
            config: PoolConfig::default(),
            equality: Arc::new(equality),
            retry: None,
        }
    }

    pub fn min_count(mut self, min_count: usize) -> Self {
        self.config.min_count = min_count;
        self
    }

    pub fn max_count(mut self, max_count: usize) -> Self {
        self.config.max_count = Some(max_count);
        self
    }

    /// Replace all counts (and the config's retry section) at once.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Layer a retry policy over the pool. Takes precedence over `config.retry`.
    pub fn retry(mut self, policy: RetryPolicy<M::Error>) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Validate the configuration and wire the handles.
    ///
    /// Fails with [`ConfigError::MaxBelowMin`] before anything is created.
    pub fn build(self) -> Result<(PoolHandle<M>, Administration<M>), ConfigError> {
        self.config.validate()?;

        let retry = self
            .retry
            .or_else(|| self.config.retry.as_ref().map(|r| r.to_policy()));

        let shared = Arc::new(Shared::new(
            self.manager,
            self.config.min_count,
            self.config.max_count,
            self.equality,
        ));

        tracing::info!(
            pool = %shared.id,
            min_count = self.config.min_count,
            max_count = ?self.config.max_count,
            retry = ?retry,
            "Pool created"
        );

        let mut handle = PoolHandle::from(Pool::from_shared(Arc::clone(&shared)));
        if let Some(policy) = retry {
            handle = handle.with_retry(policy);
        }

        Ok((handle, Administration::from_shared(shared)))
    }
}

/// Build a pool from a config, matching released resources with `==`.
pub fn create_pool<M>(
    manager: M,
    config: PoolConfig,
) -> Result<(PoolHandle<M>, Administration<M>), ConfigError>
where
    M: Manager,
    M::Resource: PartialEq,
{
    PoolBuilder::new(manager).config(config).build()
}
