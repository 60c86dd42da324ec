//! Administrative handle: capacity introspection and idle eviction.
//!
//! Eviction takes the selected resources out of the store in one synchronous
//! section (their slots become `Empty` immediately, so no acquire can pick
//! them up), then destroys them concurrently. A failed destroy is reported
//! but never puts the resource back.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::DestroyError;
use crate::manager::Manager;
use crate::pool::{PoolId, Shared};
use crate::store::Slot;

/// Predicate over `(returned_at, now, resource)`.
pub type IdlePredicate<R> = Box<dyn Fn(Instant, Instant, &R) -> bool + Send + Sync>;

/// When an idle resource is old enough to evict.
pub enum IdleTime<R> {
    /// Idle for at least this long.
    After(Duration),
    /// Custom rule.
    Predicate(IdlePredicate<R>),
}

impl<R> IdleTime<R> {
    pub fn predicate(f: impl Fn(Instant, Instant, &R) -> bool + Send + Sync + 'static) -> Self {
        IdleTime::Predicate(Box::new(f))
    }

    fn is_expired(&self, returned_at: Instant, now: Instant, resource: &R) -> bool {
        match self {
            IdleTime::After(duration) => now.saturating_duration_since(returned_at) >= *duration,
            IdleTime::Predicate(f) => f(returned_at, now, resource),
        }
    }
}

impl<R> From<Duration> for IdleTime<R> {
    fn from(duration: Duration) -> Self {
        IdleTime::After(duration)
    }
}

impl<R> std::fmt::Debug for IdleTime<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdleTime::After(d) => f.debug_tuple("After").field(d).finish(),
            IdleTime::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Result of one eviction pass.
#[derive(Debug)]
pub struct EvictionReport<E> {
    /// Resources removed from the pool, whether or not their destroy succeeded.
    pub resources_deleted: usize,
    pub errors: Vec<DestroyError<E>>,
}

impl<E> EvictionReport<E> {
    pub fn is_empty(&self) -> bool {
        self.resources_deleted == 0
    }
}

/// Point-in-time view of a pool for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub min_count: usize,
    pub max_count: Option<usize>,
    /// Live slots: idle + in use + reserved.
    pub resources: usize,
    pub idle: usize,
    pub in_use: usize,
    pub reserved: usize,
}

impl PoolStatus {
    /// Every slot the pool may hold is checked out or being created.
    pub fn is_exhausted(&self) -> bool {
        self.idle == 0 && self.max_count.is_some_and(|max| self.resources >= max)
    }
}

/// Administrative pool handle.
///
/// Hand this to privileged code (a cleanup task, a metrics endpoint) only;
/// it cannot acquire or release, and the operational handle cannot reach it.
pub struct Administration<M: Manager> {
    shared: Arc<Shared<M>>,
}

impl<M: Manager> Clone for Administration<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Manager> std::fmt::Debug for Administration<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Administration")
            .field("id", &self.shared.id)
            .field("min_count", &self.shared.min_count)
            .field("max_count", &self.shared.max_count)
            .finish()
    }
}

impl<M: Manager> Administration<M> {
    pub(crate) fn from_shared(shared: Arc<Shared<M>>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> PoolId {
        self.shared.id
    }

    pub fn min_count(&self) -> usize {
        self.shared.min_count
    }

    pub fn max_count(&self) -> Option<usize> {
        self.shared.max_count
    }

    /// Idle, checked-out and in-creation resources. Lock-free.
    pub fn current_resource_count(&self) -> usize {
        self.shared.live()
    }

    pub fn status(&self) -> PoolStatus {
        self.shared.with_store(|store| PoolStatus {
            min_count: self.shared.min_count,
            max_count: self.shared.max_count,
            resources: store.count_live(),
            idle: store.count_idle(),
            in_use: store.count_in_use(),
            reserved: store.count_reserved(),
        })
    }

    /// Evict idle resources that satisfy `idle_time`.
    ///
    /// Slots below `min_count` are exempt by position, not by recency. The
    /// predicate sees a copy of each idle resource and may read the pool.
    pub async fn run_eviction(
        &self,
        idle_time: impl Into<IdleTime<M::Resource>>,
    ) -> EvictionReport<M::Error> {
        self.evict(&idle_time.into()).await
    }

    async fn evict(&self, idle_time: &IdleTime<M::Resource>) -> EvictionReport<M::Error> {
        let now = Instant::now();
        let min_count = self.shared.min_count;

        // Predicate runs on a snapshot, outside the lock.
        let candidates = self.shared.with_store(|store| {
            (min_count..store.len())
                .filter_map(|index| match store.get(index) {
                    Some(Slot::Idle {
                        resource,
                        returned_at,
                    }) => Some((index, resource.clone(), *returned_at)),
                    _ => None,
                })
                .collect::<Vec<_>>()
        });

        let expired: Vec<(usize, Instant)> = candidates
            .into_iter()
            .filter(|(_, resource, returned_at)| idle_time.is_expired(*returned_at, now, resource))
            .map(|(index, _, returned_at)| (index, returned_at))
            .collect();

        // A slot acquired (and maybe released again) since the snapshot no longer matches.
        let selected = self.shared.with_store(|store| {
            let mut selected = Vec::new();
            for (index, snapshot_at) in expired {
                let unchanged = matches!(
                    store.get(index),
                    Some(Slot::Idle { returned_at, .. }) if *returned_at == snapshot_at
                );
                if unchanged && let Slot::Idle { resource, .. } = store.replace(index, Slot::Empty) {
                    selected.push((index, resource));
                }
            }
            store.truncate_empty_tail();
            selected
        });

        if selected.is_empty() {
            return EvictionReport {
                resources_deleted: 0,
                errors: Vec::new(),
            };
        }

        let manager = &self.shared.manager;
        let outcomes = futures::future::join_all(selected.into_iter().map(
            |(slot, resource)| async move {
                manager
                    .destroy(resource)
                    .await
                    .map_err(|source| DestroyError { slot, source })
            },
        ))
        .await;

        let resources_deleted = outcomes.len();
        let errors: Vec<_> = outcomes.into_iter().filter_map(Result::err).collect();

        for error in &errors {
            tracing::warn!(pool = %self.shared.id, slot = error.slot, error = %error.source, "Failed to destroy evicted resource");
        }
        tracing::info!(
            pool = %self.shared.id,
            evicted = resources_deleted,
            failed = errors.len(),
            remaining = self.shared.live(),
            "Evicted idle resources"
        );

        EvictionReport {
            resources_deleted,
            errors,
        }
    }

    /// Run eviction every `period` until `cancel` fires.
    ///
    /// The first pass happens one `period` after spawning. Panics if `period` is zero.
    pub fn spawn_evictor(
        &self,
        period: Duration,
        idle_time: impl Into<IdleTime<M::Resource>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let admin = self.clone();
        let idle_time = idle_time.into();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(pool = %admin.shared.id, "Evictor stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        admin.evict(&idle_time).await;
                    }
                }
            }
        })
    }
}
