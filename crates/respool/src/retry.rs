//! Retrying acquire.
//!
//! A [`PoolHandle`] is either the plain pool or a retry layer around another
//! handle. Every layer keeps the original [`Pool`], so release and
//! [`PoolHandle::original`] always reach the undecorated pool no matter how
//! many layers are stacked. Stacked layers compose: an outer layer retries
//! the inner layer's whole retry sequence.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::PoolError;
use crate::manager::Manager;
use crate::pool::Pool;

/// Dynamic backoff: `(error, attempt)` to a wait, or a terminal error.
pub type BackoffFn<E> =
    Arc<dyn Fn(&PoolError<E>, u32) -> Result<Duration, PoolError<E>> + Send + Sync>;

/// Decides whether a failed attempt may be retried.
pub type RetryableFn<E> = Arc<dyn Fn(&PoolError<E>) -> bool + Send + Sync>;

enum Schedule<E> {
    Fixed { retry_count: u32, wait: Duration },
    Exponential { retry_count: u32, base: Duration },
    Dynamic(BackoffFn<E>),
}

impl<E> Clone for Schedule<E> {
    fn clone(&self) -> Self {
        match self {
            Schedule::Fixed { retry_count, wait } => Schedule::Fixed {
                retry_count: *retry_count,
                wait: *wait,
            },
            Schedule::Exponential { retry_count, base } => Schedule::Exponential {
                retry_count: *retry_count,
                base: *base,
            },
            Schedule::Dynamic(f) => Schedule::Dynamic(Arc::clone(f)),
        }
    }
}

/// How and when a failed acquire is re-attempted.
///
/// By default only [`PoolError::PoolFull`] is retryable; anything else
/// (a creation error, for instance) is returned from the first attempt.
pub struct RetryPolicy<E> {
    schedule: Schedule<E>,
    retryable: RetryableFn<E>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            schedule: self.schedule.clone(),
            retryable: Arc::clone(&self.retryable),
        }
    }
}

impl<E> std::fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schedule {
            Schedule::Fixed { retry_count, wait } => f
                .debug_struct("RetryPolicy::Fixed")
                .field("retry_count", retry_count)
                .field("wait", wait)
                .finish(),
            Schedule::Exponential { retry_count, base } => f
                .debug_struct("RetryPolicy::Exponential")
                .field("retry_count", retry_count)
                .field("base", base)
                .finish(),
            Schedule::Dynamic(_) => f.write_str("RetryPolicy::Dynamic(..)"),
        }
    }
}

impl<E: 'static> RetryPolicy<E> {
    /// Retry up to `retry_count` times, waiting `wait_before_retry` between attempts.
    pub fn fixed(retry_count: u32, wait_before_retry: Duration) -> Self {
        Self::with_schedule(Schedule::Fixed {
            retry_count,
            wait: wait_before_retry,
        })
    }

    /// Retry up to `retry_count` times, waiting `base * 2^attempt` (capped at 2^10).
    pub fn exponential(retry_count: u32, base: Duration) -> Self {
        Self::with_schedule(Schedule::Exponential { retry_count, base })
    }

    /// Let `f` decide after every retryable failure. `attempt` is 1-based and
    /// counts the attempt that just failed.
    pub fn dynamic(
        f: impl Fn(&PoolError<E>, u32) -> Result<Duration, PoolError<E>> + Send + Sync + 'static,
    ) -> Self {
        Self::with_schedule(Schedule::Dynamic(Arc::new(f)))
    }

    fn with_schedule(schedule: Schedule<E>) -> Self {
        Self {
            schedule,
            retryable: Arc::new(|e: &PoolError<E>| e.is_pool_full()),
        }
    }

    /// Replace the retryable-error test.
    pub fn retry_if(mut self, f: impl Fn(&PoolError<E>) -> bool + Send + Sync + 'static) -> Self {
        self.retryable = Arc::new(f);
        self
    }

    /// A static policy with no retries adds nothing to a pool.
    pub fn is_noop(&self) -> bool {
        match self.schedule {
            Schedule::Fixed { retry_count, .. } | Schedule::Exponential { retry_count, .. } => {
                retry_count == 0
            }
            Schedule::Dynamic(_) => false,
        }
    }

    pub fn is_retryable(&self, error: &PoolError<E>) -> bool {
        (self.retryable)(error)
    }

    /// Wait before the next attempt, or the error to give up with.
    pub fn next_wait(&self, error: PoolError<E>, attempt: u32) -> Result<Duration, PoolError<E>> {
        let (retry_count, wait) = match &self.schedule {
            Schedule::Dynamic(f) => return f(&error, attempt),
            Schedule::Fixed { retry_count, wait } => (*retry_count, *wait),
            Schedule::Exponential { retry_count, base } => {
                (*retry_count, base.saturating_mul(1u32 << attempt.min(10)))
            }
        };

        if attempt > retry_count {
            return Err(PoolError::NoMoreRetriesLeft {
                attempts: attempt,
                last: Box::new(error),
            });
        }
        Ok(wait)
    }
}

/// Operational pool handle, optionally carrying retry behavior.
pub enum PoolHandle<M: Manager> {
    Plain(Pool<M>),
    Retrying(RetryPool<M>),
}

impl<M: Manager> Clone for PoolHandle<M> {
    fn clone(&self) -> Self {
        match self {
            PoolHandle::Plain(pool) => PoolHandle::Plain(pool.clone()),
            PoolHandle::Retrying(retrying) => PoolHandle::Retrying(retrying.clone()),
        }
    }
}

impl<M: Manager> std::fmt::Debug for PoolHandle<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolHandle::Plain(pool) => f.debug_tuple("Plain").field(pool).finish(),
            PoolHandle::Retrying(retrying) => f.debug_tuple("Retrying").field(retrying).finish(),
        }
    }
}

impl<M: Manager> From<Pool<M>> for PoolHandle<M> {
    fn from(pool: Pool<M>) -> Self {
        PoolHandle::Plain(pool)
    }
}

impl<M: Manager> PoolHandle<M> {
    pub async fn acquire(&self) -> Result<M::Resource, PoolError<M::Error>> {
        match self {
            PoolHandle::Plain(pool) => pool.acquire().await,
            PoolHandle::Retrying(retrying) => retrying.acquire().await,
        }
    }

    /// Release is never retried; it goes straight to the original pool.
    pub fn release(&self, resource: M::Resource) -> Result<(), PoolError<M::Error>> {
        self.original().release(resource)
    }

    pub fn is_retry_wrapped(&self) -> bool {
        matches!(self, PoolHandle::Retrying(_))
    }

    /// The undecorated pool beneath every retry layer.
    pub fn original(&self) -> &Pool<M> {
        match self {
            PoolHandle::Plain(pool) => pool,
            PoolHandle::Retrying(retrying) => &retrying.original,
        }
    }

    pub fn into_original(self) -> Pool<M> {
        match self {
            PoolHandle::Plain(pool) => pool,
            PoolHandle::Retrying(retrying) => retrying.original,
        }
    }

    /// Add a retry layer. A no-op policy returns the handle unchanged.
    pub fn with_retry(self, policy: RetryPolicy<M::Error>) -> Self {
        if policy.is_noop() {
            return self;
        }
        let original = self.original().clone();
        PoolHandle::Retrying(RetryPool {
            original,
            inner: Box::new(self),
            policy,
        })
    }
}

/// A retry layer over another handle.
pub struct RetryPool<M: Manager> {
    original: Pool<M>,
    inner: Box<PoolHandle<M>>,
    policy: RetryPolicy<M::Error>,
}

impl<M: Manager> Clone for RetryPool<M> {
    fn clone(&self) -> Self {
        Self {
            original: self.original.clone(),
            inner: self.inner.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<M: Manager> std::fmt::Debug for RetryPool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPool")
            .field("inner", &self.inner)
            .field("policy", &self.policy)
            .finish()
    }
}

impl<M: Manager> RetryPool<M> {
    pub fn policy(&self) -> &RetryPolicy<M::Error> {
        &self.policy
    }

    /// Boxed: layers nest, so this future contains another handle's acquire.
    fn acquire(&self) -> BoxFuture<'_, Result<M::Resource, PoolError<M::Error>>> {
        async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                let error = match self.inner.acquire().await {
                    Ok(resource) => return Ok(resource),
                    Err(e) => e,
                };

                if !self.policy.is_retryable(&error) {
                    return Err(error);
                }

                let wait = match self.policy.next_wait(error, attempt) {
                    Ok(wait) => wait,
                    Err(e) => {
                        tracing::warn!(pool = %self.original.id(), attempts = attempt, error = %e, "Giving up on acquire");
                        return Err(e);
                    }
                };

                tracing::debug!(
                    pool = %self.original.id(),
                    attempt,
                    wait_ms = wait.as_millis(),
                    "Acquire failed, retrying"
                );
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PoolBuilder;
    use crate::manager::FnManager;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    #[error("connection refused")]
    struct Refused;

    fn counting_manager(
        fail: bool,
    ) -> (impl Manager<Resource = u32, Error = Refused>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let manager = FnManager::new(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { if fail { Err(Refused) } else { Ok(n) } }
            },
            |_r: u32| async { Ok::<_, Refused>(()) },
        );
        (manager, calls)
    }

    fn counting_full_check(counter: Arc<AtomicU32>) -> impl Fn(&PoolError<Refused>) -> bool {
        move |e| {
            counter.fetch_add(1, Ordering::SeqCst);
            e.is_pool_full()
        }
    }

    #[tokio::test]
    async fn exhausts_after_retry_count_plus_one_attempts() {
        let (manager, _) = counting_manager(false);
        let (pool, _admin) = PoolBuilder::new(manager).max_count(0).build().unwrap();

        let failures = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::fixed(2, Duration::ZERO).retry_if(counting_full_check(Arc::clone(&failures)));
        let pool = pool.with_retry(policy);

        let err = pool.acquire().await.unwrap_err();

        assert!(matches!(err, PoolError::NoMoreRetriesLeft { attempts: 3, .. }));
        assert!(err.is_pool_full());
        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn create_errors_are_not_retried() {
        let (manager, calls) = counting_manager(true);
        let (pool, _admin) = PoolBuilder::new(manager)
            .retry(RetryPolicy::fixed(5, Duration::ZERO))
            .build()
            .unwrap();

        let err = pool.acquire().await.unwrap_err();

        assert!(matches!(err, PoolError::Create(Refused)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zero_retries_is_a_pass_through() {
        let (manager, _) = counting_manager(false);
        let (pool, _admin) = PoolBuilder::new(manager).build().unwrap();

        let pool = pool.with_retry(RetryPolicy::fixed(0, Duration::from_secs(1)));
        assert!(!pool.is_retry_wrapped());

        let pool = pool.with_retry(RetryPolicy::fixed(1, Duration::ZERO));
        assert!(pool.is_retry_wrapped());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_once_capacity_frees() {
        let (manager, calls) = counting_manager(false);
        let (pool, _admin) = PoolBuilder::new(manager).max_count(1).build().unwrap();
        let held = pool.acquire().await.unwrap();

        let releaser = pool.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            releaser.release(held).unwrap();
        });

        let pool = pool.with_retry(RetryPolicy::fixed(10, Duration::from_millis(10)));
        let resource = pool.acquire().await.unwrap();

        assert_eq!(resource, held);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dynamic_policy_can_fail_terminally() {
        let (manager, _) = counting_manager(false);
        let (pool, _admin) = PoolBuilder::new(manager).max_count(0).build().unwrap();

        let seen = Arc::new(AtomicU32::new(0));
        let seen_by_policy = Arc::clone(&seen);
        let pool = pool.with_retry(RetryPolicy::dynamic(move |error, attempt| {
            assert!(error.is_pool_full());
            seen_by_policy.store(attempt, Ordering::SeqCst);
            if attempt >= 2 {
                Err(PoolError::Create(Refused))
            } else {
                Ok(Duration::ZERO)
            }
        }));

        let err = pool.acquire().await.unwrap_err();

        assert!(matches!(err, PoolError::Create(Refused)));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stacked_layers_compose_and_unwrap_to_original() {
        let (manager, _) = counting_manager(false);
        let (pool, _admin) = PoolBuilder::new(manager).max_count(0).build().unwrap();

        let inner_failures = Arc::new(AtomicU32::new(0));
        let pool = pool
            .with_retry(
                RetryPolicy::fixed(1, Duration::ZERO)
                    .retry_if(counting_full_check(Arc::clone(&inner_failures))),
            )
            .with_retry(RetryPolicy::fixed(2, Duration::ZERO));

        let err = pool.acquire().await.unwrap_err();

        // (1 + 1) inner attempts for each of (2 + 1) outer attempts.
        assert_eq!(inner_failures.load(Ordering::SeqCst), 6);
        assert!(matches!(err, PoolError::NoMoreRetriesLeft { attempts: 3, .. }));

        let original = pool.into_original();
        assert!(matches!(
            original.acquire().await,
            Err(PoolError::PoolFull { max_count: 0 })
        ));
    }

    #[tokio::test]
    async fn release_passes_through_every_layer() {
        let (manager, _) = counting_manager(false);
        let (pool, admin) = PoolBuilder::new(manager).build().unwrap();
        let pool = pool
            .with_retry(RetryPolicy::fixed(1, Duration::ZERO))
            .with_retry(RetryPolicy::exponential(1, Duration::from_millis(1)));

        let r = pool.acquire().await.unwrap();
        pool.release(r).unwrap();

        assert_eq!(admin.status().idle, 1);
        assert!(pool.release(r).unwrap_err().is_not_part_of_pool());
    }

    #[test]
    fn exponential_wait_doubles_and_caps() {
        let policy: RetryPolicy<Refused> = RetryPolicy::exponential(20, Duration::from_millis(100));
        let full = || PoolError::PoolFull { max_count: 1 };

        assert_eq!(policy.next_wait(full(), 1).unwrap(), Duration::from_millis(200));
        assert_eq!(policy.next_wait(full(), 2).unwrap(), Duration::from_millis(400));
        assert_eq!(
            policy.next_wait(full(), 15).unwrap(),
            Duration::from_millis(100 * 1024)
        );
    }

    #[test]
    fn exponential_wait_saturates_on_huge_base() {
        let config = crate::config::RetryConfig {
            retry_count: 20,
            wait_before_retry_ms: u64::MAX,
            exponential: true,
        };
        let policy: RetryPolicy<Refused> = config.to_policy();

        let wait = policy
            .next_wait(PoolError::PoolFull { max_count: 1 }, 10)
            .unwrap();
        assert_eq!(wait, Duration::MAX);
    }
}
