//! Acquire/release engine and the operational pool handle.
//!
//! All slot mutations happen inside `Shared::with_store`, which holds the store
//! mutex for a synchronous section only. The single suspension point of an
//! acquire is the manager's `create`, and the slot it fills is reserved before
//! that call starts:
//!
//! ```text
//! lock: find idle | check capacity | reserve index   (sync)
//! create()                                           (async, own task)
//! lock: commit InUse / Idle, or reset to Empty       (sync)
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::PoolError;
use crate::manager::Manager;
use crate::store::{Slot, SlotStore};

/// Predicate matching a released resource against a checked-out one.
///
/// Runs inside the store's critical section: it must be pure and must not
/// call back into either pool handle, which would deadlock.
pub type Equality<R> = Arc<dyn Fn(&R, &R) -> bool + Send + Sync>;

/// Identity of a pool instance, attached to its log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PoolId(uuid::Uuid);

impl PoolId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State shared by the operational and administrative handles.
pub(crate) struct Shared<M: Manager> {
    pub(crate) id: PoolId,
    pub(crate) manager: M,
    pub(crate) min_count: usize,
    pub(crate) max_count: Option<usize>,
    equality: Equality<M::Resource>,
    store: Mutex<SlotStore<M::Resource>>,
    /// Live slot count, republished after every store mutation.
    live: AtomicUsize,
}

impl<M: Manager> Shared<M> {
    pub(crate) fn new(
        manager: M,
        min_count: usize,
        max_count: Option<usize>,
        equality: Equality<M::Resource>,
    ) -> Self {
        Self {
            id: PoolId::new(),
            manager,
            min_count,
            max_count,
            equality,
            store: Mutex::new(SlotStore::new()),
            live: AtomicUsize::new(0),
        }
    }

    /// Run a synchronous section against the store.
    ///
    /// The closure must not block; nothing else can touch the store while it runs.
    pub(crate) fn with_store<T>(&self, f: impl FnOnce(&mut SlotStore<M::Resource>) -> T) -> T {
        // Store mutations are single assignments, so a poisoned store is still consistent.
        let mut store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        let out = f(&mut store);
        self.live.store(store.count_live(), Ordering::Release);
        out
    }

    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Flip a committed-but-unclaimed resource back to idle.
    fn mark_idle(&self, index: usize) {
        self.with_store(|store| {
            if let Some(Slot::InUse(resource)) = store.get(index).cloned() {
                store.replace(
                    index,
                    Slot::Idle {
                        resource,
                        returned_at: Instant::now(),
                    },
                );
            }
        });
    }
}

/// Outcome of the synchronous first half of an acquire.
enum Claim<R> {
    Idle { index: usize, resource: R },
    Reserved { index: usize },
    Full { max_count: usize },
}

/// A reserved slot owned by an in-flight creation.
///
/// Dropping it without [`commit`](Reservation::commit) resets the slot to
/// `Empty`, which also covers a panicking `create`.
struct Reservation<M: Manager> {
    shared: Arc<Shared<M>>,
    index: usize,
    committed: bool,
}

impl<M: Manager> Reservation<M> {
    fn new(shared: Arc<Shared<M>>, index: usize) -> Self {
        Self {
            shared,
            index,
            committed: false,
        }
    }

    fn commit(mut self, slot: Slot<M::Resource>) {
        self.shared.with_store(|store| store.replace(self.index, slot));
        self.committed = true;
    }
}

impl<M: Manager> Drop for Reservation<M> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        self.shared
            .with_store(|store| store.replace(self.index, Slot::Empty));
        tracing::debug!(pool = %self.shared.id, slot = self.index, "Reservation released");
    }
}

/// Acquirer's end of an in-flight creation.
///
/// Dropped before the result is read, it closes the channel and hands any
/// resource already delivered back to the pool as idle.
struct PendingCreate<M: Manager> {
    rx: oneshot::Receiver<Result<M::Resource, M::Error>>,
    shared: Arc<Shared<M>>,
    index: usize,
    claimed: bool,
}

impl<M: Manager> Drop for PendingCreate<M> {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        // After close, a send that has not happened yet fails and the create task marks idle itself.
        self.rx.close();
        if let Ok(Ok(_)) = self.rx.try_recv() {
            tracing::debug!(pool = %self.shared.id, slot = self.index, "Acquirer gone after delivery - returning resource as idle");
            self.shared.mark_idle(self.index);
        }
    }
}

/// Operational pool handle: acquire and release only.
///
/// Cheap to clone; every clone drives the same slot store.
pub struct Pool<M: Manager> {
    shared: Arc<Shared<M>>,
}

impl<M: Manager> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Manager> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("id", &self.shared.id).finish()
    }
}

impl<M: Manager> Pool<M> {
    pub(crate) fn from_shared(shared: Arc<Shared<M>>) -> Self {
        Self { shared }
    }

    pub(crate) fn id(&self) -> PoolId {
        self.shared.id
    }

    /// Check out a resource.
    ///
    /// Reuses the first idle resource if there is one. Otherwise creates a new
    /// one unless the pool is at `max_count`, in which case it fails fast with
    /// [`PoolError::PoolFull`]; there is no waiting queue.
    pub async fn acquire(&self) -> Result<M::Resource, PoolError<M::Error>> {
        let claim = self.shared.with_store(|store| {
            if let Some((index, resource)) = checkout_idle(store) {
                return Claim::Idle { index, resource };
            }

            if let Some(max_count) = self.shared.max_count
                && store.count_live() >= max_count
            {
                return Claim::Full { max_count };
            }

            let index = store.find_reusable_index();
            store.replace(index, Slot::Reserved);
            Claim::Reserved { index }
        });

        match claim {
            Claim::Idle { index, resource } => {
                tracing::debug!(pool = %self.shared.id, slot = index, "Reusing idle resource");
                Ok(resource)
            }
            Claim::Full { max_count } => {
                tracing::debug!(pool = %self.shared.id, max_count, "Pool full");
                Err(PoolError::PoolFull { max_count })
            }
            Claim::Reserved { index } => self.create_into(index).await,
        }
    }

    /// Fill a reserved slot.
    ///
    /// Creation runs on its own task so it completes and commits even if the
    /// caller stops waiting; an unclaimed resource is committed idle.
    async fn create_into(&self, index: usize) -> Result<M::Resource, PoolError<M::Error>> {
        tracing::debug!(pool = %self.shared.id, slot = index, "Creating resource");

        let (tx, rx) = oneshot::channel();
        let shared = Arc::clone(&self.shared);
        // Owned by the task from here on, so a task dropped unpolled still frees the slot.
        let reservation = Reservation::new(Arc::clone(&shared), index);
        let mut pending = PendingCreate {
            rx,
            shared: Arc::clone(&self.shared),
            index,
            claimed: false,
        };

        tokio::spawn(async move {
            match shared.manager.create().await {
                Ok(resource) => {
                    if tx.is_closed() {
                        tracing::debug!(pool = %shared.id, slot = index, "Acquirer gone - committing resource as idle");
                        reservation.commit(Slot::Idle {
                            resource,
                            returned_at: Instant::now(),
                        });
                        return;
                    }

                    reservation.commit(Slot::InUse(resource.clone()));
                    if tx.send(Ok(resource)).is_err() {
                        shared.mark_idle(index);
                    }
                }
                Err(e) => {
                    tracing::warn!(pool = %shared.id, slot = index, error = %e, "Failed to create resource");
                    drop(reservation);
                    let _ = tx.send(Err(e));
                }
            }
        });

        let outcome = (&mut pending.rx).await;
        pending.claimed = true;

        match outcome {
            Ok(Ok(resource)) => Ok(resource),
            Ok(Err(e)) => Err(PoolError::Create(e)),
            Err(_) => {
                tracing::error!(pool = %self.shared.id, slot = index, "Resource creation task aborted");
                Err(PoolError::CreateAborted)
            }
        }
    }

    /// Return a checked-out resource, making it idle.
    ///
    /// Fails with [`PoolError::NotPartOfPool`] if no checked-out slot holds a
    /// matching resource (already released, or from another pool).
    pub fn release(&self, resource: M::Resource) -> Result<(), PoolError<M::Error>> {
        let equality = &self.shared.equality;
        let released = self.shared.with_store(|store| {
            let index = store.position_in_use(|held| equality(held, &resource))?;
            if let Slot::InUse(held) = store.replace(index, Slot::Empty) {
                store.replace(
                    index,
                    Slot::Idle {
                        resource: held,
                        returned_at: Instant::now(),
                    },
                );
            }
            Some(index)
        });

        match released {
            Some(index) => {
                tracing::debug!(pool = %self.shared.id, slot = index, "Resource released");
                Ok(())
            }
            None => {
                tracing::warn!(pool = %self.shared.id, "Release of resource not part of pool");
                Err(PoolError::NotPartOfPool)
            }
        }
    }
}

/// Move the first idle resource to `InUse`, returning a copy for the caller.
fn checkout_idle<R: Clone>(store: &mut SlotStore<R>) -> Option<(usize, R)> {
    let index = store.find_idle_slot()?;
    match store.replace(index, Slot::Empty) {
        Slot::Idle { resource, .. } => {
            store.replace(index, Slot::InUse(resource.clone()));
            Some((index, resource))
        }
        other => {
            store.replace(index, other);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::FnManager;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, thiserror::Error)]
    #[error("create failed")]
    struct CreateFailed;

    fn counting_pool(
        max_count: Option<usize>,
    ) -> (Pool<impl Manager<Resource = u32, Error = CreateFailed>>, Arc<AtomicU32>) {
        let created = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&created);
        let manager = FnManager::new(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, CreateFailed>(n) }
            },
            |_r: u32| async { Ok::<_, CreateFailed>(()) },
        );
        let shared = Shared::new(manager, 0, max_count, Arc::new(|a: &u32, b: &u32| a == b));
        (Pool::from_shared(Arc::new(shared)), created)
    }

    #[tokio::test]
    async fn acquire_creates_then_reuses() {
        let (pool, created) = counting_pool(None);

        let first = pool.acquire().await.unwrap();
        pool.release(first).unwrap();
        let second = pool.acquire().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn acquire_fails_fast_when_full() {
        let (pool, _) = counting_pool(Some(1));

        let _held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();

        assert!(matches!(err, PoolError::PoolFull { max_count: 1 }));
    }

    #[tokio::test]
    async fn release_twice_is_not_part_of_pool() {
        let (pool, _) = counting_pool(None);

        let r = pool.acquire().await.unwrap();
        pool.release(r).unwrap();

        assert!(pool.release(r).unwrap_err().is_not_part_of_pool());
        assert!(pool.release(99).unwrap_err().is_not_part_of_pool());
    }

    #[tokio::test]
    async fn failed_create_frees_its_slot() {
        let manager = FnManager::new(
            || async { Err::<u32, _>(CreateFailed) },
            |_r: u32| async { Ok::<_, CreateFailed>(()) },
        );
        let shared = Arc::new(Shared::new(manager, 0, Some(1), Arc::new(|a: &u32, b: &u32| a == b)));
        let pool = Pool::from_shared(Arc::clone(&shared));

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Create(CreateFailed)));
        assert_eq!(shared.live(), 0);

        // The freed slot is reusable, so the next failure is again a create error.
        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_create());
    }

    #[tokio::test]
    async fn panicking_create_is_aborted_and_freed() {
        let manager = FnManager::new(
            || async {
                if true {
                    panic!("create exploded");
                }
                Ok::<u32, CreateFailed>(0)
            },
            |_r: u32| async { Ok::<_, CreateFailed>(()) },
        );
        let shared = Arc::new(Shared::new(manager, 0, None, Arc::new(|a: &u32, b: &u32| a == b)));
        let pool = Pool::from_shared(Arc::clone(&shared));

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::CreateAborted));
        assert_eq!(shared.live(), 0);
    }

    #[tokio::test]
    async fn failed_create_does_not_disturb_concurrent_create() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let manager = FnManager::new(
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        // Slow success on slot 0.
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(100)
                    } else {
                        Err(CreateFailed)
                    }
                }
            },
            |_r: u32| async { Ok::<_, CreateFailed>(()) },
        );
        let shared = Arc::new(Shared::new(manager, 0, None, Arc::new(|a: &u32, b: &u32| a == b)));
        let pool = Pool::from_shared(Arc::clone(&shared));

        let (slow, fast) = tokio::join!(pool.acquire(), pool.acquire());

        assert_eq!(slow.unwrap(), 100);
        assert!(fast.unwrap_err().is_create());
        shared.with_store(|store| {
            assert!(store.get(0).is_some_and(Slot::is_in_use));
            assert!(store.get(1).is_some_and(Slot::is_empty));
        });
    }

    #[tokio::test]
    async fn abandoned_acquire_commits_idle() {
        let manager = FnManager::new(
            || async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, CreateFailed>(7u32)
            },
            |_r: u32| async { Ok::<_, CreateFailed>(()) },
        );
        let shared = Arc::new(Shared::new(manager, 0, None, Arc::new(|a: &u32, b: &u32| a == b)));
        let pool = Pool::from_shared(Arc::clone(&shared));

        let abandoned = tokio::time::timeout(Duration::from_millis(1), pool.acquire()).await;
        assert!(abandoned.is_err());
        assert_eq!(shared.live(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        shared.with_store(|store| assert!(store.get(0).is_some_and(Slot::is_idle)));
        assert_eq!(pool.acquire().await.unwrap(), 7);
    }

    fn instant_shared(
        max_count: Option<usize>,
    ) -> Arc<Shared<impl Manager<Resource = u32, Error = CreateFailed>>> {
        let manager = FnManager::new(
            || async { Ok::<_, CreateFailed>(7u32) },
            |_r: u32| async { Ok::<_, CreateFailed>(()) },
        );
        Arc::new(Shared::new(manager, 0, max_count, Arc::new(|a: &u32, b: &u32| a == b)))
    }

    #[tokio::test]
    async fn acquire_dropped_after_delivery_returns_resource_idle() {
        let shared = instant_shared(Some(1));
        let pool = Pool::from_shared(Arc::clone(&shared));

        let mut acquire = Box::pin(pool.acquire());
        assert!(futures::poll!(acquire.as_mut()).is_pending());

        // Let the create task commit and send before the acquirer goes away.
        for _ in 0..100 {
            if shared.with_store(|store| store.count_in_use()) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(shared.with_store(|store| store.count_in_use()), 1);
        drop(acquire);

        shared.with_store(|store| {
            assert_eq!(store.count_in_use(), 0);
            assert!(store.get(0).is_some_and(Slot::is_idle));
        });
        assert_eq!(pool.acquire().await.unwrap(), 7);
    }

    #[test]
    fn runtime_shutdown_before_create_frees_reservation() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let shared = instant_shared(Some(1));
        let pool = Pool::from_shared(Arc::clone(&shared));

        runtime.block_on(async {
            let mut acquire = Box::pin(pool.acquire());
            assert!(futures::poll!(acquire.as_mut()).is_pending());
        });
        assert_eq!(shared.live(), 1);

        // The create task was spawned but never polled.
        drop(runtime);
        assert_eq!(shared.live(), 0);
    }
}
