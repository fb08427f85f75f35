//! readgate: pinned-thread reads over a fixed slot pool, plus a rendezvous
//! barrier that lets a writer pause a cohort of readers.
//!
//! - [`SlotPool`]: N pre-allocated slots, exclusive leases, blocking acquire.
//! - [`AffinityWorker`]: runs every job on a fresh OS thread so a transaction
//!   handle is begun, used and ended on one thread.
//! - [`Barrier`]: `Open` / `Raised(K)` gate served by a single task.
//! - [`ConcurrencyManager`]: composes the three behind `run_pooled_read`,
//!   `run_update` and `shutdown`.
//!
//! The storage engine is supplied through [`TxnFactory`].

mod barrier;
mod config;
mod error;
mod manager;
mod pool;
mod slot;
mod txn;
mod worker;

#[cfg(test)]
mod testing;

pub use barrier::{ArrivalId, Barrier, BarrierStatus, GateMode};
pub use config::{DEFAULT_BUFFER_CAPACITY, DEFAULT_MAX_READERS, DEFAULT_THREAD_PREFIX, ManagerConfig};
pub use error::{Error, Result};
pub use manager::{ConcurrencyManager, ManagerSnapshot};
pub use pool::{CloseMode, PoolStats, SlotLease, SlotPool};
pub use slot::{LeaseId, Owner, SlotBuffers, SlotId};
pub use txn::{Transaction, TxnFactory, TxnMode};
pub use worker::AffinityWorker;
