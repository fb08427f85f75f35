//! In-memory engine standing in for a real transactional store.
//!
//! Transactions are `!Send`, so handing one to another thread is a compile
//! error. The store counts open read transactions; a write that begins while
//! any read is open is recorded as an overlap.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::anyhow;
use readgate::{SlotId, Transaction, TxnFactory, TxnMode};

#[derive(Default)]
struct Store {
    data: RwLock<BTreeMap<Vec<u8>, u64>>,
    open_reads: AtomicUsize,
    overlapping_writes: AtomicUsize,
    commits: AtomicU64,
    generation: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MemEngine {
    store: Arc<Store>,
}

impl MemEngine {
    pub fn seeded(keys: usize) -> Self {
        let engine = Self::default();
        if let Ok(mut data) = engine.store.data.write() {
            for i in 0..keys {
                data.insert(key(i), 0);
            }
        }
        engine
    }

    pub fn commits(&self) -> u64 {
        self.store.commits.load(Ordering::Acquire)
    }

    pub fn overlapping_writes(&self) -> usize {
        self.store.overlapping_writes.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u64 {
        self.store.generation.load(Ordering::Acquire)
    }
}

pub fn key(i: usize) -> Vec<u8> {
    format!("key-{i:06}").into_bytes()
}

pub struct MemTxn {
    store: Arc<Store>,
    mode: TxnMode,
    pending: RefCell<Vec<(Vec<u8>, u64)>>,
    _pinned: PhantomData<*const ()>,
}

impl MemTxn {
    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<u64>> {
        let data = self
            .store
            .data
            .read()
            .map_err(|_| anyhow!("store lock poisoned"))?;
        Ok(data.get(key).copied())
    }

    pub fn put(&self, key: &[u8], value: u64) -> anyhow::Result<()> {
        if self.mode.is_read_only() {
            anyhow::bail!("put on a read-only transaction");
        }
        self.pending.borrow_mut().push((key.to_vec(), value));
        Ok(())
    }

    /// Rewrite every key with the next generation number.
    pub fn compact(&self) -> anyhow::Result<u64> {
        let next = self.store.generation.load(Ordering::Acquire) + 1;
        let keys: Vec<Vec<u8>> = {
            let data = self
                .store
                .data
                .read()
                .map_err(|_| anyhow!("store lock poisoned"))?;
            data.keys().cloned().collect()
        };
        for key in keys {
            self.put(&key, next)?;
        }
        Ok(next)
    }

    fn close(&self) {
        if self.mode.is_read_only() {
            self.store.open_reads.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Transaction for MemTxn {
    fn abort(self) {
        self.close();
    }

    fn commit(self) -> anyhow::Result<()> {
        self.close();
        let pending = self.pending.take();
        if pending.is_empty() {
            return Ok(());
        }

        let mut data = self
            .store
            .data
            .write()
            .map_err(|_| anyhow!("store lock poisoned"))?;
        let mut newest = 0;
        for (key, value) in pending {
            newest = newest.max(value);
            data.insert(key, value);
        }
        drop(data);

        self.store.generation.fetch_max(newest, Ordering::AcqRel);
        self.store.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

impl TxnFactory for MemEngine {
    type Txn = MemTxn;

    fn begin(&self, slot: SlotId, mode: TxnMode) -> anyhow::Result<MemTxn> {
        match mode {
            TxnMode::ReadOnly => {
                self.store.open_reads.fetch_add(1, Ordering::AcqRel);
            }
            TxnMode::ReadWrite => {
                let open = self.store.open_reads.load(Ordering::Acquire);
                if open > 0 {
                    tracing::warn!(%slot, open, "Write began while reads were open");
                    self.store.overlapping_writes.fetch_add(1, Ordering::AcqRel);
                }
            }
        }

        Ok(MemTxn {
            store: Arc::clone(&self.store),
            mode,
            pending: RefCell::new(Vec::new()),
            _pinned: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_applies_pending_writes() {
        let engine = MemEngine::seeded(3);
        let txn = engine.begin(SlotId::new(0), TxnMode::ReadWrite).unwrap();
        assert_eq!(txn.compact().unwrap(), 1);
        assert_eq!(txn.get(&key(0)).unwrap(), Some(0), "writes are not visible before commit");
        txn.commit().unwrap();

        let reader = engine.begin(SlotId::new(1), TxnMode::ReadOnly).unwrap();
        assert_eq!(reader.get(&key(2)).unwrap(), Some(1));
        reader.abort();
        assert_eq!(engine.commits(), 1);
        assert_eq!(engine.generation(), 1);
    }

    #[test]
    fn abort_discards_writes() {
        let engine = MemEngine::seeded(1);
        let txn = engine.begin(SlotId::new(0), TxnMode::ReadWrite).unwrap();
        txn.put(&key(0), 9).unwrap();
        txn.abort();
        assert_eq!(engine.commits(), 0);
    }

    #[test]
    fn write_during_open_read_is_counted() {
        let engine = MemEngine::seeded(1);
        let reader = engine.begin(SlotId::new(0), TxnMode::ReadOnly).unwrap();
        assert!(reader.put(&key(0), 1).is_err());

        let writer = engine.begin(SlotId::new(1), TxnMode::ReadWrite).unwrap();
        assert_eq!(engine.overlapping_writes(), 1);
        writer.abort();
        reader.abort();

        let writer = engine.begin(SlotId::new(1), TxnMode::ReadWrite).unwrap();
        writer.abort();
        assert_eq!(engine.overlapping_writes(), 1);
    }
}
