//! Write policy around the graph store: bounded parallelism, bounded
//! retries, and a deadline per attempt so one bad host cannot stall the
//! scan pipeline.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

use crate::server::graph::nodes::HostWriteBatch;
use crate::server::graph::store::GraphStore;

/// Concurrent host transactions against the graph store
pub const WRITE_PARALLELISM: usize = 8;

const ATTEMPT_DEADLINE: Duration = Duration::from_secs(5);
const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_millis(800),
];

#[derive(Debug, Error)]
#[error("graph write for {ip} failed after {attempts} attempts: {last_error}")]
pub struct WriteError {
    pub ip: Ipv4Addr,
    pub attempts: usize,
    pub last_error: String,
}

pub struct GraphWriter {
    store: Arc<dyn GraphStore>,
    limiter: Arc<Semaphore>,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn GraphStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            limiter: Arc::new(Semaphore::new(WRITE_PARALLELISM)),
        })
    }

    /// Reserve a write slot; holding the permit bounds how many host
    /// transactions run at once
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        self.limiter
            .clone()
            .acquire_owned()
            .await
            .expect("Semaphore closed")
    }

    /// Upsert one host, retrying transient failures with backoff. After the
    /// final retry the host is skipped and the error returned for logging.
    pub async fn write_host(&self, batch: &HostWriteBatch) -> Result<(), WriteError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = timeout(ATTEMPT_DEADLINE, self.store.upsert_host(batch)).await;
            let error = match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!("attempt deadline ({}s) exceeded", ATTEMPT_DEADLINE.as_secs()),
            };

            let Some(backoff) = RETRY_BACKOFF.get(attempts - 1) else {
                return Err(WriteError {
                    ip: batch.ip,
                    attempts,
                    last_error: error,
                });
            };
            tracing::debug!(
                ip = %batch.ip,
                attempt = attempts,
                "Graph write failed ({error}), retrying in {}ms",
                backoff.as_millis()
            );
            tokio::time::sleep(*backoff).await;
        }
    }
}
