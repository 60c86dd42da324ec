//! The create/destroy seam between the pool and the resources it manages.

use std::future::Future;

use async_trait::async_trait;

/// Creates and destroys the resources a pool hands out.
///
/// Resources are cloned out of their slot on acquire, so expensive handles
/// are usually wrapped in an `Arc` (or are cheap ids into another table).
#[async_trait]
pub trait Manager: Send + Sync + 'static {
    type Resource: Clone + Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a new resource. Runs on its own task and always commits its slot.
    async fn create(&self) -> Result<Self::Resource, Self::Error>;

    /// Destroy an evicted resource. Called once per evicted resource.
    async fn destroy(&self, resource: Self::Resource) -> Result<(), Self::Error>;
}

/// A [`Manager`] built from a pair of closures.
///
/// ```
/// use respool::FnManager;
///
/// #[derive(Debug, thiserror::Error)]
/// #[error("unreachable")]
/// struct Never;
///
/// let manager = FnManager::new(
///     || async { Ok::<_, Never>(42u32) },
///     |_conn: u32| async { Ok::<_, Never>(()) },
/// );
/// ```
pub struct FnManager<C, D> {
    create: C,
    destroy: D,
}

impl<C, D> FnManager<C, D> {
    pub fn new(create: C, destroy: D) -> Self {
        Self { create, destroy }
    }
}

impl<C, D> std::fmt::Debug for FnManager<C, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnManager").finish_non_exhaustive()
    }
}

#[async_trait]
impl<C, D, CF, DF, R, E> Manager for FnManager<C, D>
where
    C: Fn() -> CF + Send + Sync + 'static,
    CF: Future<Output = Result<R, E>> + Send + 'static,
    D: Fn(R) -> DF + Send + Sync + 'static,
    DF: Future<Output = Result<(), E>> + Send + 'static,
    R: Clone + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    type Resource = R;
    type Error = E;

    async fn create(&self) -> Result<R, E> {
        (self.create)().await
    }

    async fn destroy(&self, resource: R) -> Result<(), E> {
        (self.destroy)(resource).await
    }
}
