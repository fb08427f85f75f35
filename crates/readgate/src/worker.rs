//! Affinity worker - runs every job on its own pinned OS thread.
//!
//! Architecture:
//! - Dispatcher: one dedicated thread draining the job channel. It never runs
//!   jobs itself; it only spawns.
//! - Workers: one fresh thread per job. The job binds its slot, begins its
//!   transaction, runs, ends the transaction and releases the slot on that
//!   thread, then the thread exits. Threads are never reused.
//!
//! Callers stay on the async runtime and wait on a oneshot for the result,
//! so a large number of readers does not pin a large number of callers.

use std::any::Any;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::pool::SlotLease;
use crate::slot::{SlotBuffers, SlotId};
use crate::txn::{Transaction, TxnFactory, TxnMode};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Counts a job from submission until its closure is run or dropped.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Affinity worker mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

/// Dispatcher plus per-job pinned worker threads.
pub struct AffinityWorker {
    jobs_tx: StdMutex<Option<mpsc::UnboundedSender<Job>>>,
    done_rx: StdMutex<Option<oneshot::Receiver<()>>>,
    dispatcher: StdMutex<Option<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
}

impl AffinityWorker {
    /// Start the dispatcher thread. Worker threads are named
    /// `{thread_prefix}-{n}`.
    pub fn new(thread_prefix: impl Into<String>) -> Result<Self> {
        let prefix = thread_prefix.into();
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel::<Job>();
        let (done_tx, done_rx) = oneshot::channel();

        let dispatcher = thread::Builder::new()
            .name(format!("{prefix}-dispatch"))
            .spawn(move || dispatch_loop(jobs_rx, prefix, done_tx))?;

        Ok(Self {
            jobs_tx: StdMutex::new(Some(jobs_tx)),
            done_rx: StdMutex::new(Some(done_rx)),
            dispatcher: StdMutex::new(Some(dispatcher)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Run `job` on a fresh pinned thread and wait for its result.
    ///
    /// Fails with `ShutdownInProgress` once `halt` has begun. If the caller
    /// stops waiting, the job still runs to completion on its thread.
    pub async fn submit<T, J>(&self, job: J) -> Result<T>
    where
        T: Send + 'static,
        J: FnOnce() -> Result<T> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        {
            let jobs_tx = lock(&self.jobs_tx);
            let Some(jobs_tx) = jobs_tx.as_ref() else {
                return Err(Error::ShutdownInProgress);
            };

            let in_flight = InFlight::enter(&self.in_flight);
            let wrapped: Job = Box::new(move || {
                let _in_flight = in_flight;
                let outcome = job();
                if result_tx.send(outcome).is_err() {
                    tracing::debug!("Submitter stopped waiting before the result was delivered");
                }
            });

            jobs_tx.send(wrapped).map_err(|_| Error::ShutdownInProgress)?;
        }

        result_rx.await.map_err(|_| Error::WorkerLost)?
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_halted(&self) -> bool {
        lock(&self.jobs_tx).is_none()
    }

    /// Stop accepting jobs and wait for every in-flight worker to finish.
    ///
    /// A second call returns `ShutdownInProgress` without waiting.
    pub async fn halt(&self) -> Result<()> {
        let Some(jobs_tx) = lock(&self.jobs_tx).take() else {
            return Err(Error::ShutdownInProgress);
        };
        drop(jobs_tx);
        tracing::info!(in_flight = self.in_flight(), "Halting affinity worker");

        let done_rx = lock(&self.done_rx).take();
        if let Some(done_rx) = done_rx
            && done_rx.await.is_err()
        {
            tracing::error!("Dispatcher exited without signalling completion");
        }

        let dispatcher = lock(&self.dispatcher).take();
        if let Some(handle) = dispatcher {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => tracing::error!("Dispatcher thread panicked"),
                Err(e) => tracing::error!(error = %e, "Failed to join dispatcher thread"),
            }
        }

        tracing::info!("Affinity worker halted");
        Ok(())
    }
}

impl Drop for AffinityWorker {
    fn drop(&mut self) {
        if lock(&self.jobs_tx).take().is_some() {
            tracing::warn!(
                in_flight = self.in_flight(),
                "AffinityWorker dropped without halt - in-flight workers are detached"
            );
        }
    }
}

fn dispatch_loop(
    mut jobs_rx: mpsc::UnboundedReceiver<Job>,
    prefix: String,
    done_tx: oneshot::Sender<()>,
) {
    tracing::debug!("Dispatcher started");
    let mut workers: Vec<JoinHandle<()>> = Vec::new();
    let mut spawned: u64 = 0;

    while let Some(job) = jobs_rx.blocking_recv() {
        reap_finished(&mut workers);

        spawned += 1;
        let name = format!("{prefix}-{spawned}");
        // On spawn failure the job is dropped, which drops its result
        // sender and its lease; the submitter observes WorkerLost.
        match thread::Builder::new().name(name).spawn(job) {
            Ok(handle) => workers.push(handle),
            Err(e) => tracing::error!(error = %e, job = spawned, "Failed to spawn pinned worker"),
        }
    }

    tracing::debug!(remaining = workers.len(), "Dispatcher draining workers");
    for handle in workers {
        join_worker(handle);
    }

    let _ = done_tx.send(());
    tracing::debug!(spawned, "Dispatcher exiting");
}

fn reap_finished(workers: &mut Vec<JoinHandle<()>>) {
    let (finished, running): (Vec<_>, Vec<_>) =
        mem::take(workers).into_iter().partition(|h| h.is_finished());
    *workers = running;
    for handle in finished {
        join_worker(handle);
    }
}

fn join_worker(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("unnamed").to_string();
    if handle.join().is_err() {
        tracing::error!(thread = %name, "Pinned worker panicked");
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Body of one pinned job: bind, begin, run, end, release.
///
/// Must be called on the worker thread that owns the job. The slot is
/// released on this thread whatever the job's outcome; a release failure
/// overrides the job's own result.
pub(crate) fn run_bound_job<F, T, J>(
    factory: &F,
    mut lease: SlotLease,
    mode: TxnMode,
    job: J,
) -> Result<T>
where
    F: TxnFactory,
    J: FnOnce(&F::Txn, &mut SlotBuffers) -> anyhow::Result<T>,
{
    lease.bind_current_thread()?;
    let slot = lease.id();
    tracing::trace!(%slot, ?mode, thread = ?thread::current().id(), "Pinned job starting");

    let outcome = run_in_txn(factory, slot, lease.buffers_mut(), mode, job);
    lease.release()?;

    tracing::trace!(%slot, ok = outcome.is_ok(), "Pinned job finished");
    outcome
}

fn run_in_txn<F, T, J>(
    factory: &F,
    slot: SlotId,
    buffers: &mut SlotBuffers,
    mode: TxnMode,
    job: J,
) -> Result<T>
where
    F: TxnFactory,
    J: FnOnce(&F::Txn, &mut SlotBuffers) -> anyhow::Result<T>,
{
    let txn = factory
        .begin(slot, mode)
        .map_err(|source| Error::Transaction { slot, source })?;

    let result = panic::catch_unwind(AssertUnwindSafe(|| job(&txn, buffers)));

    match result {
        Err(payload) => {
            txn.abort();
            let message = panic_message(payload.as_ref());
            tracing::error!(%slot, %message, "Job panicked on pinned worker");
            Err(Error::JobPanicked { slot, message })
        }
        Ok(Err(source)) => {
            txn.abort();
            Err(Error::JobFailed { slot, source })
        }
        Ok(Ok(value)) if mode.is_read_only() => {
            txn.abort();
            Ok(value)
        }
        Ok(Ok(value)) => {
            txn.commit()
                .map_err(|source| Error::Transaction { slot, source })?;
            Ok(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::pool::SlotPool;
    use crate::testing::{RecordingFactory, TxnEvent};

    #[tokio::test]
    async fn job_runs_off_the_caller_thread() {
        let worker = AffinityWorker::new("test-worker").unwrap();
        let caller = thread::current().id();

        let (ran_on, name) = worker
            .submit(|| {
                let current = thread::current();
                Ok((current.id(), current.name().map(str::to_string)))
            })
            .await
            .unwrap();

        assert_ne!(ran_on, caller);
        assert_eq!(name.as_deref(), Some("test-worker-1"));
        worker.halt().await.unwrap();
    }

    #[tokio::test]
    async fn every_job_gets_a_fresh_thread() {
        let worker = AffinityWorker::new("test-worker").unwrap();

        let first = worker.submit(|| Ok(thread::current().id())).await.unwrap();
        let second = worker.submit(|| Ok(thread::current().id())).await.unwrap();
        assert_ne!(first, second);

        worker.halt().await.unwrap();
    }

    #[tokio::test]
    async fn job_error_is_returned_verbatim() {
        let worker = AffinityWorker::new("test-worker").unwrap();
        let outcome: Result<()> = worker
            .submit(|| Err(Error::BarrierMisuse("from job".into())))
            .await;
        assert!(matches!(outcome, Err(Error::BarrierMisuse(m)) if m == "from job"));
        worker.halt().await.unwrap();
    }

    #[tokio::test]
    async fn panicking_job_reports_worker_lost() {
        let worker = AffinityWorker::new("test-worker").unwrap();
        let outcome: Result<()> = worker.submit(|| panic!("boom")).await;
        assert!(matches!(outcome, Err(Error::WorkerLost)));
        worker.halt().await.unwrap();
        assert_eq!(worker.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn halt_waits_for_in_flight_job() {
        let worker = Arc::new(AffinityWorker::new("test-worker").unwrap());
        let (started_tx, started_rx) = std_mpsc::channel();
        let (finish_tx, finish_rx) = std_mpsc::channel::<()>();

        let submitted = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                worker
                    .submit(move || {
                        started_tx.send(()).unwrap();
                        finish_rx.recv().unwrap();
                        Ok(42)
                    })
                    .await
            })
        };

        tokio::task::spawn_blocking(move || started_rx.recv().unwrap())
            .await
            .unwrap();
        assert_eq!(worker.in_flight(), 1);

        let halting = {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move { worker.halt().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!halting.is_finished(), "halt must wait for the running job");
        assert!(matches!(
            worker.submit(|| Ok(())).await,
            Err(Error::ShutdownInProgress)
        ));

        finish_tx.send(()).unwrap();
        timeout(Duration::from_secs(2), halting)
            .await
            .expect("halt should finish once the job does")
            .unwrap()
            .unwrap();
        assert_eq!(submitted.await.unwrap().unwrap(), 42);
        assert_eq!(worker.in_flight(), 0);
        assert!(matches!(worker.halt().await, Err(Error::ShutdownInProgress)));
    }

    #[tokio::test]
    async fn bound_job_runs_whole_txn_lifetime_on_one_thread() {
        let factory = RecordingFactory::new();
        let pool = SlotPool::new("test", 1, 16).unwrap();
        let worker = AffinityWorker::new("test-worker").unwrap();

        let lease = pool.acquire().await.unwrap();
        let job_factory = factory.clone();
        let value = worker
            .submit(move || {
                run_bound_job(&job_factory, lease, TxnMode::ReadOnly, |txn, buffers| {
                    buffers.key_mut().extend_from_slice(b"answer");
                    Ok(txn.get(buffers.key()))
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 6);
        assert_eq!(factory.violations(), 0);
        let threads = factory.threads();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], thread::current().id());
        assert_eq!(
            factory.kinds(),
            vec![TxnEvent::Begin, TxnEvent::Use, TxnEvent::Abort]
        );
        assert_eq!(pool.available(), 1);
        worker.halt().await.unwrap();
    }

    #[tokio::test]
    async fn bound_job_error_still_releases_and_aborts() {
        let factory = RecordingFactory::new();
        let pool = SlotPool::new("test", 1, 16).unwrap();
        let worker = AffinityWorker::new("test-worker").unwrap();

        let lease = pool.acquire().await.unwrap();
        let job_factory = factory.clone();
        let outcome: Result<()> = worker
            .submit(move || {
                run_bound_job(&job_factory, lease, TxnMode::ReadOnly, |_, _| {
                    Err(anyhow::anyhow!("missing key"))
                })
            })
            .await;

        match outcome {
            Err(Error::JobFailed { source, .. }) => assert_eq!(source.to_string(), "missing key"),
            other => panic!("expected JobFailed, got {other:?}"),
        }
        assert_eq!(factory.kinds(), vec![TxnEvent::Begin, TxnEvent::Abort]);
        assert_eq!(pool.available(), 1);
        worker.halt().await.unwrap();
    }

    #[tokio::test]
    async fn bound_job_panic_is_contained() {
        let factory = RecordingFactory::new();
        let pool = SlotPool::new("test", 1, 16).unwrap();
        let worker = AffinityWorker::new("test-worker").unwrap();

        let lease = pool.acquire().await.unwrap();
        let job_factory = factory.clone();
        let outcome: Result<()> = worker
            .submit(move || {
                run_bound_job(&job_factory, lease, TxnMode::ReadOnly, |_, _| {
                    panic!("reader bug")
                })
            })
            .await;

        assert!(matches!(outcome, Err(Error::JobPanicked { message, .. }) if message == "reader bug"));
        assert_eq!(factory.kinds(), vec![TxnEvent::Begin, TxnEvent::Abort]);
        assert_eq!(pool.available(), 1);
        worker.halt().await.unwrap();
    }

    #[tokio::test]
    async fn begin_failure_releases_slot() {
        let factory = RecordingFactory::failing_begin();
        let pool = SlotPool::new("test", 1, 16).unwrap();
        let worker = AffinityWorker::new("test-worker").unwrap();

        let lease = pool.acquire().await.unwrap();
        let job_factory = factory.clone();
        let outcome: Result<()> = worker
            .submit(move || {
                run_bound_job(&job_factory, lease, TxnMode::ReadOnly, |_, _| Ok(()))
            })
            .await;

        assert!(matches!(outcome, Err(Error::Transaction { .. })));
        assert_eq!(pool.available(), 1);
        worker.halt().await.unwrap();
    }

    #[tokio::test]
    async fn write_job_commits_on_success() {
        let factory = RecordingFactory::new();
        let pool = SlotPool::new("test", 1, 16).unwrap();
        let worker = AffinityWorker::new("test-worker").unwrap();

        let lease = pool.acquire().await.unwrap();
        let job_factory = factory.clone();
        worker
            .submit(move || {
                run_bound_job(&job_factory, lease, TxnMode::ReadWrite, |txn, _| {
                    txn.get(b"k");
                    Ok(())
                })
            })
            .await
            .unwrap();

        assert_eq!(
            factory.kinds(),
            vec![TxnEvent::Begin, TxnEvent::Use, TxnEvent::Commit]
        );
        worker.halt().await.unwrap();
    }

    #[test]
    fn panic_message_extracts_strings() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(payload.as_ref()), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
