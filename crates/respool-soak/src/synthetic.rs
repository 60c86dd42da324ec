//! Fake connections with configurable create latency and injected failures.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use respool::Manager;

#[derive(Debug, thiserror::Error)]
pub enum SyntheticError {
    #[error("injected create failure on attempt {0}")]
    Injected(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticConnection {
    pub id: u64,
}

#[derive(Debug)]
pub struct SyntheticConnections {
    latency: Duration,
    fail_every: Option<u64>,
    attempts: AtomicU64,
    created: Arc<AtomicU64>,
    destroyed: Arc<AtomicU64>,
}

impl SyntheticConnections {
    pub fn new(latency: Duration, fail_every: Option<u64>) -> Self {
        Self {
            latency,
            fail_every,
            attempts: AtomicU64::new(0),
            created: Arc::new(AtomicU64::new(0)),
            destroyed: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn created(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.created)
    }

    pub fn destroyed(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.destroyed)
    }
}

#[async_trait]
impl Manager for SyntheticConnections {
    type Resource = SyntheticConnection;
    type Error = SyntheticError;

    async fn create(&self) -> Result<SyntheticConnection, SyntheticError> {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        tokio::time::sleep(self.latency).await;

        if self.fail_every.is_some_and(|n| attempt % n == 0) {
            return Err(SyntheticError::Injected(attempt));
        }

        let id = self.created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, "Opened synthetic connection");
        Ok(SyntheticConnection { id })
    }

    async fn destroy(&self, conn: SyntheticConnection) -> Result<(), SyntheticError> {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id = conn.id, "Closed synthetic connection");
        Ok(())
    }
}
