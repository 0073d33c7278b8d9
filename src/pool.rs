//! Process-wide worker pool
//!
//! The pool is an explicit singleton: nothing creates it implicitly. Jobs run
//! as tokio tasks, each holding one numbered worker slot for its whole
//! lifetime, so the pool size bounds how many jobs make progress at once.

use crate::error::{FlowError, Result};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

static POOL: RwLock<Option<Arc<WorkerPool>>> = parking_lot::const_rwlock(None);

tokio::task_local! {
    static CURRENT_WORKER: usize;
}

/// Install a pool of `size` workers, replacing any previous one.
///
/// Work already dispatched to a replaced pool finishes there.
pub fn init_worker_pool(size: usize) -> Result<Arc<WorkerPool>> {
    if size == 0 {
        return Err(FlowError::invalid_step("worker pool", "size must be at least 1"));
    }
    let pool = Arc::new(WorkerPool::new(size));
    let previous = POOL.write().replace(Arc::clone(&pool));
    tracing::info!(size, replaced = previous.is_some(), "Worker pool initialized");
    Ok(pool)
}

/// Remove the pool. Jobs still waiting for a slot fail.
pub fn shutdown_worker_pool() -> bool {
    match POOL.write().take() {
        Some(pool) => {
            pool.semaphore.close();
            tracing::info!(size = pool.size, "Worker pool shut down");
            true
        }
        None => false,
    }
}

pub fn worker_pool() -> Option<Arc<WorkerPool>> {
    POOL.read().clone()
}

/// Slot number of the pool worker running the current task
pub fn current_worker_id() -> Option<usize> {
    CURRENT_WORKER.try_with(|id| *id).ok()
}

pub struct WorkerPool {
    size: usize,
    semaphore: Arc<Semaphore>,
    free_slots: Mutex<Vec<usize>>,
}

struct WorkerSlot {
    id: usize,
    pool: Arc<WorkerPool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.pool.free_slots.lock().push(self.id);
    }
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        Self {
            size,
            semaphore: Arc::new(Semaphore::new(size)),
            free_slots: Mutex::new((0..size).rev().collect()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    async fn acquire(self: &Arc<Self>) -> Result<WorkerSlot> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| FlowError::WorkerPoolUninitialized)?;
        let id = self
            .free_slots
            .lock()
            .pop()
            .ok_or_else(|| FlowError::step("worker pool", "no free worker slot"))?;
        Ok(WorkerSlot {
            id,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Run every job on the pool and return their outputs in submission order.
    ///
    /// Each entry fails on its own when its job could not get a worker or
    /// panicked. `max_concurrent` further caps how many of these jobs run at
    /// once. Called from inside a pool job, the jobs run one after another on
    /// the caller's worker, since waiting for another slot while holding one
    /// can starve the pool.
    pub async fn run_all<T, Fut>(
        self: &Arc<Self>,
        jobs: Vec<Fut>,
        max_concurrent: Option<usize>,
    ) -> Vec<Result<T>>
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if let Some(worker) = current_worker_id() {
            tracing::debug!(worker, jobs = jobs.len(), "Running nested jobs on the current worker");
            let mut outputs = Vec::with_capacity(jobs.len());
            for job in jobs {
                outputs.push(Ok(job.await));
            }
            return outputs;
        }

        let cap = max_concurrent.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let mut handles = Vec::with_capacity(jobs.len());
        for (index, job) in jobs.into_iter().enumerate() {
            let pool = Arc::clone(self);
            let cap = cap.clone();
            handles.push(tokio::spawn(async move {
                let _cap_permit = match cap {
                    Some(cap) => Some(
                        cap.acquire_owned()
                            .await
                            .map_err(|_| FlowError::WorkerPoolUninitialized)?,
                    ),
                    None => None,
                };
                let slot = pool.acquire().await?;
                tracing::debug!(job = index, worker = slot.id, "Worker picked up job");
                Ok::<T, FlowError>(CURRENT_WORKER.scope(slot.id, job).await)
            }));
        }

        let mut outputs = Vec::with_capacity(handles.len());
        for (index, handle) in handles.into_iter().enumerate() {
            let output = handle.await.unwrap_or_else(|e| {
                tracing::warn!(job = index, error = %e, "Worker pool job panicked");
                Err(FlowError::step("worker pool", format!("job panicked: {e}")))
            });
            outputs.push(output);
        }
        outputs
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("available", &self.semaphore.available_permits())
            .finish()
    }
}
