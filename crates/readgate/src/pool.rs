//! Fixed-size slot pool.
//!
//! A semaphore carries one permit per free slot and provides the blocking,
//! first-come-first-served wait plus a broadcast wake-up on close. The
//! available set and the per-slot ownership records sit behind a single mutex,
//! so `ref_count == 0 ⇔ owner == None ⇔ id ∈ available` is checked and
//! updated in one place.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::thread;

use serde::Serialize;
use tokio::sync::{Semaphore, TryAcquireError, watch};

use crate::error::{Error, Result};
use crate::slot::{LeaseId, Owner, SlotBuffers, SlotId, SlotRecord};

/// How `close` treats slots that are still held.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseMode {
    /// Wait for every held slot to be released.
    #[default]
    Drain,
    /// Fail immediately if any slot is held.
    Strict,
}

impl CloseMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "drain" => Some(Self::Drain),
            "strict" => Some(Self::Strict),
            _ => None,
        }
    }
}

/// Point-in-time counts for a pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: &'static str,
    pub num_slots: usize,
    pub available: usize,
    pub in_use: usize,
    pub closed: bool,
    pub torn_down: bool,
}

struct PoolState {
    slots: Vec<SlotRecord>,
    available: VecDeque<SlotId>,
    closed: bool,
    torn_down: bool,
}

pub(crate) struct PoolShared {
    name: &'static str,
    state: StdMutex<PoolState>,
    permits: Semaphore,
    in_use: watch::Sender<usize>,
    next_lease: AtomicU64,
    num_slots: usize,
}

impl PoolShared {
    /// Lock the pool state. A poisoned lock is recovered: every mutation
    /// completes before any code that could panic runs.
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(pool = self.name, "Pool state mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    fn take_available(self: &Arc<Self>) -> Result<SlotLease> {
        let lease = LeaseId::new(self.next_lease.fetch_add(1, Ordering::Relaxed));

        let mut state = self.lock_state();
        if state.closed {
            return Err(Error::PoolClosed);
        }

        let Some(slot) = state.available.pop_front() else {
            // A permit without a free slot means the accounting is broken.
            tracing::error!(pool = self.name, "Permit granted with no available slot");
            return Err(Error::PoolClosed);
        };

        let record = &mut state.slots[slot.index()];
        if !record.is_free() {
            tracing::error!(
                pool = self.name,
                %slot,
                owner = ?record.owner,
                ref_count = record.ref_count,
                "Slot in available set is still owned"
            );
            return Err(Error::ownership(slot, "slot in the available set is still owned"));
        }

        record.ref_count = 1;
        record.owner = Some(Owner::Lease(lease));
        let buffers = record.buffers.take().unwrap_or_default();
        // Counted under the lock so a concurrent drain never sees an owned
        // slot with `in_use == 0`.
        self.in_use.send_modify(|n| *n += 1);
        drop(state);

        tracing::trace!(pool = self.name, %slot, %lease, "Slot acquired");

        Ok(SlotLease {
            slot,
            lease,
            buffers,
            pool: Arc::clone(self),
            released: false,
        })
    }

    fn bind(&self, slot: SlotId, lease: LeaseId) -> Result<()> {
        let current = thread::current().id();
        let mut state = self.lock_state();
        let record = &mut state.slots[slot.index()];

        match record.owner {
            Some(Owner::Lease(held)) if held == lease => {
                record.owner = Some(Owner::Thread {
                    lease,
                    thread: current,
                });
                tracing::trace!(pool = self.name, %slot, %lease, thread = ?current, "Slot bound to thread");
                Ok(())
            }
            Some(Owner::Thread { lease: held, thread }) if held == lease && thread == current => {
                Ok(())
            }
            other => {
                tracing::error!(
                    pool = self.name,
                    %slot,
                    %lease,
                    owner = ?other,
                    thread = ?current,
                    "Refusing to bind slot owned by someone else"
                );
                Err(Error::ownership(
                    slot,
                    format!("{lease} cannot bind a slot owned by {other:?}"),
                ))
            }
        }
    }

    fn owner_of(&self, slot: SlotId) -> Option<Owner> {
        self.lock_state().slots[slot.index()].owner
    }

    /// Return a slot to the available set.
    ///
    /// With `force` only the lease is checked, not the thread; only the drop
    /// path uses it. `buffers` is taken only when the slot is returned.
    fn give_back(
        &self,
        slot: SlotId,
        lease: LeaseId,
        buffers: &mut SlotBuffers,
        force: bool,
    ) -> Result<()> {
        let mut state = self.lock_state();
        let record = &mut state.slots[slot.index()];

        let owned = match record.owner {
            Some(owner) if force => owner.lease() == lease,
            Some(owner) => owner.admits(lease),
            None => false,
        };
        if !owned || record.ref_count == 0 {
            let owner = record.owner;
            drop(state);
            tracing::error!(
                pool = self.name,
                %slot,
                %lease,
                ?owner,
                thread = ?thread::current().id(),
                "Release by non-owner"
            );
            return Err(Error::ownership(
                slot,
                format!("{lease} released a slot it does not own (owner: {owner:?})"),
            ));
        }

        record.ref_count -= 1;
        if record.ref_count > 0 {
            return Ok(());
        }
        record.owner = None;
        record.buffers = Some(std::mem::take(buffers));
        state.available.push_back(slot);
        self.in_use.send_modify(|n| *n = n.saturating_sub(1));
        drop(state);

        // Wake after unlocking so the acquirer does not contend on the lock.
        self.permits.add_permits(1);
        tracing::trace!(pool = self.name, %slot, %lease, "Slot released");
        Ok(())
    }
}

/// Exclusive hold on one slot.
///
/// Released explicitly with [`SlotLease::release`]. A lease dropped without
/// release is logged as a leak and its slot is reclaimed so the pool cannot
/// wedge.
pub struct SlotLease {
    slot: SlotId,
    lease: LeaseId,
    buffers: SlotBuffers,
    pool: Arc<PoolShared>,
    released: bool,
}

impl SlotLease {
    pub fn id(&self) -> SlotId {
        self.slot
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease
    }

    pub fn buffers(&self) -> &SlotBuffers {
        &self.buffers
    }

    pub fn buffers_mut(&mut self) -> &mut SlotBuffers {
        &mut self.buffers
    }

    /// Current owner as recorded by the pool.
    pub fn owner(&self) -> Option<Owner> {
        self.pool.owner_of(self.slot)
    }

    /// Hand ownership from this lease to the current OS thread.
    ///
    /// Fails if the slot is already bound to a different thread; a slot is
    /// never silently reassigned.
    pub fn bind_current_thread(&mut self) -> Result<()> {
        self.pool.bind(self.slot, self.lease)
    }

    /// Check that the caller (this lease, on this thread) owns the slot.
    pub fn confirm_owned(&self) -> Result<()> {
        match self.owner() {
            Some(owner) if owner.admits(self.lease) => Ok(()),
            other => Err(Error::ownership(
                self.slot,
                format!(
                    "{} on thread {:?} does not own the slot (owner: {other:?})",
                    self.lease,
                    thread::current().id()
                ),
            )),
        }
    }

    /// Release the slot back to its pool.
    ///
    /// Once bound, only the bound thread may release. On an ownership
    /// violation the error is returned and the lease is dropped unreleased,
    /// so the drop path logs the leak and reclaims the slot.
    pub fn release(mut self) -> Result<()> {
        let outcome = self
            .pool
            .give_back(self.slot, self.lease, &mut self.buffers, false);
        self.released = outcome.is_ok();
        outcome
    }

    fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }
}

impl std::fmt::Debug for SlotLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotLease")
            .field("pool", &self.pool.name)
            .field("slot", &self.slot)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        match self.pool.owner_of(self.slot) {
            Some(Owner::Thread { .. }) => {
                tracing::error!(
                    pool = self.pool.name,
                    slot = %self.slot,
                    lease = %self.lease,
                    "Bound SlotLease dropped without release - reclaiming slot"
                );
            }
            _ => {
                tracing::warn!(
                    pool = self.pool.name,
                    slot = %self.slot,
                    lease = %self.lease,
                    "SlotLease dropped without release - reclaiming slot"
                );
            }
        }

        let _ = self
            .pool
            .give_back(self.slot, self.lease, &mut self.buffers, true);
    }
}

/// Pool of `N` pre-allocated slots.
///
/// Cloning is cheap and yields another handle onto the same pool.
#[derive(Clone)]
pub struct SlotPool {
    shared: Arc<PoolShared>,
}

impl SlotPool {
    /// Build a pool with `num_slots` slots, each with scratch buffers of
    /// `buffer_capacity` bytes.
    pub fn new(name: &'static str, num_slots: usize, buffer_capacity: usize) -> Result<Self> {
        if num_slots == 0 {
            return Err(Error::InvalidConfig(format!(
                "pool '{name}' needs at least one slot"
            )));
        }

        let slots = (0..num_slots)
            .map(|i| SlotRecord::new(SlotId::new(i), buffer_capacity))
            .collect();
        let available = (0..num_slots).map(SlotId::new).collect();
        let (in_use, _) = watch::channel(0);

        tracing::debug!(pool = name, num_slots, buffer_capacity, "Slot pool created");

        Ok(Self {
            shared: Arc::new(PoolShared {
                name,
                state: StdMutex::new(PoolState {
                    slots,
                    available,
                    closed: false,
                    torn_down: false,
                }),
                permits: Semaphore::new(num_slots),
                in_use,
                next_lease: AtomicU64::new(0),
                num_slots,
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Wait for a free slot.
    ///
    /// Blocks indefinitely while the pool is exhausted; returns `PoolClosed`
    /// once `close` has begun, including for callers already waiting.
    pub async fn acquire(&self) -> Result<SlotLease> {
        let permit = self
            .shared
            .permits
            .acquire()
            .await
            .map_err(|_| Error::PoolClosed)?;
        permit.forget();
        self.shared.take_available()
    }

    /// Take a free slot if there is one.
    pub fn try_acquire(&self) -> Result<Option<SlotLease>> {
        match self.shared.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.shared.take_available().map(Some)
            }
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(Error::PoolClosed),
        }
    }

    /// Release a lease through its pool handle.
    ///
    /// A lease issued by a different pool does not own any slot here and is
    /// rejected as an ownership violation.
    pub fn release(&self, lease: SlotLease) -> Result<()> {
        if !lease.belongs_to(&self.shared) {
            let slot = lease.id();
            tracing::error!(
                pool = self.shared.name,
                %slot,
                lease_pool = lease.pool.name,
                "Release of a slot this pool never leased"
            );
            return Err(Error::ownership(
                slot,
                format!(
                    "{} was issued by pool '{}', not '{}'",
                    lease.lease, lease.pool.name, self.shared.name
                ),
            ));
        }
        lease.release()
    }

    pub fn num_slots(&self) -> usize {
        self.shared.num_slots
    }

    pub fn available(&self) -> usize {
        self.shared.lock_state().available.len()
    }

    pub fn in_use(&self) -> usize {
        *self.shared.in_use.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock_state();
        PoolStats {
            name: self.shared.name,
            num_slots: self.shared.num_slots,
            available: state.available.len(),
            in_use: *self.shared.in_use.borrow(),
            closed: state.closed,
            torn_down: state.torn_down,
        }
    }

    /// Close the pool and free every slot's buffers.
    ///
    /// New and already-waiting `acquire` calls fail with `PoolClosed` as soon
    /// as this starts. In `Drain` mode this then waits for held slots to come
    /// back; in `Strict` mode held slots fail the call with `SlotsStillHeld`
    /// and the pool stays closed but not torn down. Buffers are freed exactly
    /// once; closing a torn-down pool returns `PoolClosed`.
    pub async fn close(&self, mode: CloseMode) -> Result<()> {
        {
            let mut state = self.shared.lock_state();
            if state.torn_down {
                return Err(Error::PoolClosed);
            }
            if !state.closed {
                state.closed = true;
                self.shared.permits.close();
                tracing::info!(pool = self.shared.name, ?mode, "Closing slot pool");
            }

            if mode == CloseMode::Strict {
                let held: Vec<SlotId> = state
                    .slots
                    .iter()
                    .filter(|s| !s.is_free())
                    .map(|s| s.id)
                    .collect();
                if !held.is_empty() {
                    tracing::error!(pool = self.shared.name, ?held, "Strict close with slots still held");
                    return Err(Error::SlotsStillHeld { held });
                }
            }
        }

        let mut in_use = self.shared.in_use.subscribe();
        in_use
            .wait_for(|n| *n == 0)
            .await
            .map_err(|_| Error::ShutdownInProgress)?;

        self.teardown()
    }

    fn teardown(&self) -> Result<()> {
        let mut state = self.shared.lock_state();
        if state.torn_down {
            return Err(Error::PoolClosed);
        }

        if let Some(held) = state.slots.iter().find(|s| !s.is_free()) {
            let slot = held.id;
            tracing::error!(pool = self.shared.name, %slot, owner = ?held.owner, "Teardown with slot still owned");
            return Err(Error::ownership(slot, "teardown while the slot is still owned"));
        }

        let mut freed = 0;
        for record in state.slots.iter_mut() {
            if record.buffers.take().is_some() {
                freed += 1;
            }
        }
        state.available.clear();
        state.torn_down = true;
        drop(state);

        tracing::debug!(pool = self.shared.name, freed, "Slot buffers freed");
        Ok(())
    }
}

impl std::fmt::Debug for SlotPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotPool")
            .field("name", &self.shared.name)
            .field("num_slots", &self.shared.num_slots)
            .finish_non_exhaustive()
    }
}
