//! Slot identity, ownership and pre-allocated scratch buffers.

use std::thread::{self, ThreadId};

use serde::Serialize;

/// Identity of one pre-allocated slot.
///
/// Assigned once at pool construction and never reused for another slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Identity of one `acquire` call, distinct for every lease the pool hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(u64);

impl LeaseId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lease-{}", self.0)
    }
}

/// Who currently holds a slot.
///
/// An acquired slot starts out owned by its lease. Once a pinned worker binds
/// it, the owner is that worker's OS thread until the slot is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Lease(LeaseId),
    Thread { lease: LeaseId, thread: ThreadId },
}

impl Owner {
    pub fn lease(&self) -> LeaseId {
        match self {
            Owner::Lease(lease) => *lease,
            Owner::Thread { lease, .. } => *lease,
        }
    }

    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            Owner::Lease(_) => None,
            Owner::Thread { thread, .. } => Some(*thread),
        }
    }

    /// Whether `lease`, running on the current thread, may act as this owner.
    pub(crate) fn admits(&self, lease: LeaseId) -> bool {
        match self {
            Owner::Lease(held) => *held == lease,
            Owner::Thread { lease: held, thread } => {
                *held == lease && *thread == thread::current().id()
            }
        }
    }
}

/// Reusable key/value scratch space owned by a slot.
///
/// Allocated once when the pool is built and lent to whoever holds the slot,
/// so reads do not allocate per call.
#[derive(Debug, Default)]
pub struct SlotBuffers {
    slot: SlotId,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl SlotBuffers {
    pub(crate) fn with_capacity(slot: SlotId, capacity: usize) -> Self {
        Self {
            slot,
            key: Vec::with_capacity(capacity),
            value: Vec::with_capacity(capacity),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn key_mut(&mut self) -> &mut Vec<u8> {
        &mut self.key
    }

    pub fn value_mut(&mut self) -> &mut Vec<u8> {
        &mut self.value
    }

    /// Empty both buffers, keeping their allocations.
    pub fn clear(&mut self) {
        self.key.clear();
        self.value.clear();
    }

    pub fn capacity(&self) -> usize {
        self.key.capacity().min(self.value.capacity())
    }
}

/// Per-slot bookkeeping, only ever touched under the pool lock.
#[derive(Debug)]
pub(crate) struct SlotRecord {
    pub id: SlotId,
    pub owner: Option<Owner>,
    pub ref_count: u32,
    /// `None` while lent to a lease or after teardown.
    pub buffers: Option<SlotBuffers>,
}

impl SlotRecord {
    pub fn new(id: SlotId, buffer_capacity: usize) -> Self {
        Self {
            id,
            owner: None,
            ref_count: 0,
            buffers: Some(SlotBuffers::with_capacity(id, buffer_capacity)),
        }
    }

    pub fn is_free(&self) -> bool {
        self.ref_count == 0 && self.owner.is_none()
    }
}
