//! Error taxonomy for the pool, the affinity worker and the barrier.
//!
//! Contract violations (`SlotOwnershipViolation`, `BarrierMisuse`) mean an
//! invariant is already broken. They are logged at error level where they are
//! detected and always surface to the caller. `JobFailed` is an ordinary
//! result: the caller's own error, returned unchanged as the source.

use crate::slot::SlotId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `acquire` was called after or during pool shutdown.
    #[error("slot pool is closed")]
    PoolClosed,

    /// A slot was released or bound by someone who does not own it, or the
    /// pool was torn down while slots were still held.
    #[error("slot ownership violation on {slot}: {reason}")]
    SlotOwnershipViolation { slot: SlotId, reason: String },

    /// Teardown in strict mode found slots still held.
    #[error("teardown attempted with {} slot(s) still held: {held:?}", .held.len())]
    SlotsStillHeld { held: Vec<SlotId> },

    /// Raising an already raised barrier, or a count that makes no sense.
    #[error("barrier misuse: {0}")]
    BarrierMisuse(String),

    /// The caller-supplied function returned an error while holding a slot.
    #[error("job failed on {slot}")]
    JobFailed {
        slot: SlotId,
        #[source]
        source: anyhow::Error,
    },

    /// The caller-supplied function panicked on its pinned worker.
    #[error("job panicked on {slot}: {message}")]
    JobPanicked { slot: SlotId, message: String },

    /// The pinned worker ended without reporting a result.
    #[error("worker exited before reporting a result")]
    WorkerLost,

    /// Any operation attempted after `halt`/`close` has begun.
    #[error("shutdown in progress")]
    ShutdownInProgress,

    /// The transaction collaborator failed to begin or commit.
    #[error("transaction error on {slot}")]
    Transaction {
        slot: SlotId,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn ownership(slot: SlotId, reason: impl Into<String>) -> Self {
        Self::SlotOwnershipViolation {
            slot,
            reason: reason.into(),
        }
    }

    /// True for errors that indicate a broken invariant rather than a
    /// runtime condition.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::SlotOwnershipViolation { .. } | Self::SlotsStillHeld { .. } | Self::BarrierMisuse(_)
        )
    }

    /// The caller's own error, if this is a `JobFailed`.
    pub fn job_error(&self) -> Option<&anyhow::Error> {
        match self {
            Self::JobFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
