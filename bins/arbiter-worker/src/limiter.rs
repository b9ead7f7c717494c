/// Execution Concurrency Limiter
///
/// **Core Responsibility:**
/// Cap the number of sandboxed processes (compiles and test runs) alive at
/// once across every worker loop in this process.
///
/// **Critical Properties:**
/// - Callers wait for a permit, they are never rejected
/// - The permit is released when the guard drops, on every exit path
/// - In-flight and peak counts are tracked for metrics

use crate::metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct ExecutionLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

/// Held for the lifetime of one sandboxed process.
#[derive(Debug)]
pub struct ExecutionPermit {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
}

impl Drop for ExecutionPermit {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        metrics::EXECUTIONS_IN_FLIGHT.dec();
    }
}

impl ExecutionLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> anyhow::Result<ExecutionPermit> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("execution limiter closed"))?;

        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        metrics::EXECUTIONS_IN_FLIGHT.inc();

        Ok(ExecutionPermit {
            _permit: permit,
            counters: self.counters.clone(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits held at the same time since startup.
    pub fn peak(&self) -> usize {
        self.counters.peak.load(Ordering::SeqCst)
    }
}
