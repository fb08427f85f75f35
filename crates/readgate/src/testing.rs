//! Capturing mock transaction engine for tests.
//!
//! Every begin/use/abort/commit is recorded with the OS thread it ran on.
//! Any call made from a thread other than the one that began the transaction
//! is counted as an affinity violation.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

use crate::slot::SlotId;
use crate::txn::{Transaction, TxnFactory, TxnMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxnEvent {
    Begin,
    Use,
    Abort,
    Commit,
}

#[derive(Debug, Clone)]
pub(crate) struct Record {
    pub slot: SlotId,
    pub event: TxnEvent,
    pub thread: ThreadId,
}

#[derive(Default)]
struct Log {
    records: Mutex<Vec<Record>>,
    violations: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
    fail_begin: AtomicBool,
}

#[derive(Clone, Default)]
pub(crate) struct RecordingFactory {
    log: Arc<Log>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_begin() -> Self {
        let factory = Self::new();
        factory.log.fail_begin.store(true, Ordering::SeqCst);
        factory
    }

    pub fn records(&self) -> Vec<Record> {
        self.log.records.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<TxnEvent> {
        self.records().into_iter().map(|r| r.event).collect()
    }

    /// Distinct threads that touched any transaction, in first-seen order.
    pub fn threads(&self) -> Vec<ThreadId> {
        let mut threads = Vec::new();
        for record in self.records() {
            if !threads.contains(&record.thread) {
                threads.push(record.thread);
            }
        }
        threads
    }

    pub fn violations(&self) -> usize {
        self.log.violations.load(Ordering::SeqCst)
    }

    /// Highest number of transactions open at the same time.
    pub fn max_open(&self) -> usize {
        self.log.max_open.load(Ordering::SeqCst)
    }
}

impl Log {
    fn record(&self, slot: SlotId, event: TxnEvent) {
        self.records.lock().unwrap().push(Record {
            slot,
            event,
            thread: thread::current().id(),
        });
    }
}

pub(crate) struct RecordingTxn {
    slot: SlotId,
    owner: ThreadId,
    log: Arc<Log>,
    _not_send: PhantomData<*const ()>,
}

impl RecordingTxn {
    fn check_thread(&self) {
        if thread::current().id() != self.owner {
            self.log.violations.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Stand-in for a read: records the use and returns the key length.
    pub fn get(&self, key: &[u8]) -> usize {
        self.check_thread();
        self.log.record(self.slot, TxnEvent::Use);
        key.len()
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    fn end(&self, event: TxnEvent) {
        self.check_thread();
        self.log.record(self.slot, event);
        self.log.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Transaction for RecordingTxn {
    fn abort(self) {
        self.end(TxnEvent::Abort);
    }

    fn commit(self) -> anyhow::Result<()> {
        self.end(TxnEvent::Commit);
        Ok(())
    }
}

impl TxnFactory for RecordingFactory {
    type Txn = RecordingTxn;

    fn begin(&self, slot: SlotId, _mode: TxnMode) -> anyhow::Result<RecordingTxn> {
        if self.log.fail_begin.load(Ordering::SeqCst) {
            anyhow::bail!("engine refused to begin on {slot}");
        }

        self.log.record(slot, TxnEvent::Begin);
        let open = self.log.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.max_open.fetch_max(open, Ordering::SeqCst);

        Ok(RecordingTxn {
            slot,
            owner: thread::current().id(),
            log: Arc::clone(&self.log),
            _not_send: PhantomData,
        })
    }
}
