//! Transaction collaborator seam.
//!
//! The storage engine is external. The core only needs to begin a
//! transaction on a slot from the thread that will use it, and to end it with
//! `abort` or `commit` on that same thread. Handles are not required to be
//! `Send`; engines whose handles must never cross threads should leave them
//! `!Send` so the compiler enforces affinity.

use serde::Serialize;

use crate::slot::SlotId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnMode {
    ReadOnly,
    ReadWrite,
}

impl TxnMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// An open engine transaction.
pub trait Transaction {
    /// Release engine-side resources. Safe on a handle never used for I/O.
    fn abort(self);

    /// Make the transaction's writes visible.
    fn commit(self) -> anyhow::Result<()>;
}

/// Opens transactions bound to a slot.
///
/// `begin` is always called on the pinned worker thread that will use and
/// end the returned handle.
pub trait TxnFactory: Send + Sync + 'static {
    type Txn: Transaction;

    fn begin(&self, slot: SlotId, mode: TxnMode) -> anyhow::Result<Self::Txn>;
}
