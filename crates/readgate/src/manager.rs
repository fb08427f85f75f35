//! Composition root: pooled reads on pinned threads, a single write lane, and
//! the barrier that lets a writer pause readers.
//!
//! A read flows through `SlotPool::acquire` (may wait for a free slot), then
//! `AffinityWorker::submit`. The pinned worker binds the slot, begins a
//! read-only transaction, runs the caller's function, aborts the transaction,
//! releases the slot and only then delivers the result.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::barrier::{Barrier, BarrierStatus};
use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::pool::{PoolStats, SlotPool};
use crate::slot::SlotBuffers;
use crate::txn::{TxnFactory, TxnMode};
use crate::worker::{AffinityWorker, run_bound_job};

const READER_POOL: &str = "readers";
const WRITER_POOL: &str = "writer";

/// Point-in-time view of the manager, suitable for logging as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub readers: PoolStats,
    pub writer: PoolStats,
    pub in_flight: usize,
    /// `None` once the barrier is closed.
    pub barrier: Option<BarrierStatus>,
    pub shut_down: bool,
}

pub struct ConcurrencyManager<F: TxnFactory> {
    factory: Arc<F>,
    readers: SlotPool,
    writer: SlotPool,
    worker: AffinityWorker,
    barrier: Barrier,
    config: ManagerConfig,
    shut_down: AtomicBool,
}

impl<F: TxnFactory> ConcurrencyManager<F> {
    /// Build the pools, start the dispatcher and the barrier task.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(factory: F, config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        let readers = SlotPool::new(READER_POOL, config.max_readers, config.buffer_capacity)?;
        let writer = SlotPool::new(WRITER_POOL, 1, config.buffer_capacity)?;
        let worker = AffinityWorker::new(config.worker_thread_prefix.clone())?;
        let barrier = Barrier::new();

        tracing::info!(
            max_readers = config.max_readers,
            close_mode = ?config.close_mode,
            "Concurrency manager started"
        );

        Ok(Self {
            factory: Arc::new(factory),
            readers,
            writer,
            worker,
            barrier,
            config,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Run `f` against a read-only transaction on a pooled slot.
    ///
    /// Waits for a free slot if all are held. An error from `f` comes back as
    /// `JobFailed` with the original error as its source; the slot is
    /// released either way.
    pub async fn run_pooled_read<T, R>(&self, f: R) -> Result<T>
    where
        T: Send + 'static,
        R: FnOnce(&F::Txn) -> anyhow::Result<T> + Send + 'static,
    {
        self.run_pooled_read_buffered(move |txn, _| f(txn)).await
    }

    /// Like [`run_pooled_read`](Self::run_pooled_read), also lending the
    /// slot's scratch buffers to `f`. Buffers keep their contents between
    /// jobs; clear them before use if that matters.
    pub async fn run_pooled_read_buffered<T, R>(&self, f: R) -> Result<T>
    where
        T: Send + 'static,
        R: FnOnce(&F::Txn, &mut SlotBuffers) -> anyhow::Result<T> + Send + 'static,
    {
        self.ensure_running()?;
        let lease = self.readers.acquire().await?;
        let factory = Arc::clone(&self.factory);

        self.worker
            .submit(move || run_bound_job(factory.as_ref(), lease, TxnMode::ReadOnly, f))
            .await
    }

    /// Run `f` against a read-write transaction on the single write slot.
    ///
    /// Writers are serialized. The transaction commits when `f` returns `Ok`
    /// and aborts otherwise. Pausing readers first is up to the caller; see
    /// [`barrier`](Self::barrier).
    pub async fn run_update<T, W>(&self, f: W) -> Result<T>
    where
        T: Send + 'static,
        W: FnOnce(&F::Txn, &mut SlotBuffers) -> anyhow::Result<T> + Send + 'static,
    {
        self.ensure_running()?;
        let lease = self.writer.acquire().await?;
        let factory = Arc::clone(&self.factory);

        self.worker
            .submit(move || run_bound_job(factory.as_ref(), lease, TxnMode::ReadWrite, f))
            .await
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(Error::ShutdownInProgress);
        }
        Ok(())
    }

    pub fn barrier(&self) -> &Barrier {
        &self.barrier
    }

    pub fn readers(&self) -> &SlotPool {
        &self.readers
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub async fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            readers: self.readers.stats(),
            writer: self.writer.stats(),
            in_flight: self.worker.in_flight(),
            barrier: self.barrier.status().await.ok(),
            shut_down: self.is_shut_down(),
        }
    }

    /// Halt the worker, close both pools, then close the barrier.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned. Readers still waiting for a slot get `PoolClosed`, anything
    /// parked on the barrier gets `ShutdownInProgress`. A second call returns
    /// `ShutdownInProgress`.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(Error::ShutdownInProgress);
        }
        tracing::info!(in_flight = self.worker.in_flight(), "Shutting down concurrency manager");

        let mut first_error = None;

        if let Err(e) = self.worker.halt().await {
            tracing::error!(error = %e, "Failed to halt affinity worker");
            first_error.get_or_insert(e);
        }

        for pool in [&self.readers, &self.writer] {
            if let Err(e) = pool.close(self.config.close_mode).await {
                tracing::error!(pool = pool.name(), error = %e, "Failed to close slot pool");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.barrier.close().await {
            tracing::error!(error = %e, "Failed to close barrier");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Concurrency manager shut down");
                Ok(())
            }
        }
    }
}

impl<F: TxnFactory> Drop for ConcurrencyManager<F> {
    fn drop(&mut self) {
        if !self.shut_down.load(Ordering::Acquire) {
            tracing::warn!("ConcurrencyManager dropped without shutdown");
        }
    }
}
