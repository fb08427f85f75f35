//! Rendezvous barrier that lets a writer pause a cohort of readers.
//!
//! State lives in a single coordination task. Callers only send typed requests
//! and wait on oneshot replies, so raise/park/release are applied one at a
//! time in the order the task receives them.
//!
//! ```text
//! Open ──raise_and_wait(K)──▶ Raised(K) ──release()──▶ Open
//! ```
//!
//! While raised, the first K distinct arrivals form the cohort; when the K-th
//! parks, the raiser is woken. Later arrivals are parked too, but do not count
//! toward K. Nobody parked resumes until `release`.

use std::sync::Mutex as StdMutex;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Caller-chosen identity of a parking reader.
pub type ArrivalId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    Open,
    Raised,
}

/// Snapshot of the barrier as seen by the coordination task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BarrierStatus {
    pub mode: GateMode,
    /// Target cohort size while raised.
    pub required: Option<usize>,
    /// Cohort ids in admission order.
    pub parked: Vec<ArrivalId>,
    /// Arrivals parked after the cohort was complete, or with a duplicate id.
    pub overflow: Vec<ArrivalId>,
}

enum Request {
    Raise {
        count: usize,
        reached: oneshot::Sender<Result<()>>,
    },
    Park {
        id: ArrivalId,
        resume: oneshot::Sender<()>,
    },
    Release {
        done: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<BarrierStatus>,
    },
}

struct Arrival {
    id: ArrivalId,
    resume: oneshot::Sender<()>,
}

struct Raised {
    required: usize,
    /// Taken when the cohort completes.
    reached: Option<oneshot::Sender<Result<()>>>,
}

#[derive(Default)]
struct Gate {
    raised: Option<Raised>,
    waitlist: Vec<Arrival>,
    overflow: Vec<Arrival>,
}

impl Gate {
    fn handle(&mut self, request: Request) {
        match request {
            Request::Raise { count, reached } => self.raise(count, reached),
            Request::Park { id, resume } => self.park(id, resume),
            Request::Release { done } => {
                self.release();
                let _ = done.send(());
            }
            Request::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn raise(&mut self, count: usize, reached: oneshot::Sender<Result<()>>) {
        if count == 0 {
            let _ = reached.send(Ok(()));
            return;
        }

        if let Some(current) = &self.raised {
            tracing::error!(
                required = current.required,
                requested = count,
                "Barrier raised while already raised"
            );
            let _ = reached.send(Err(Error::BarrierMisuse(format!(
                "barrier already raised for {} arrival(s)",
                current.required
            ))));
            return;
        }

        if !self.waitlist.is_empty() || !self.overflow.is_empty() {
            tracing::error!(
                parked = self.waitlist.len() + self.overflow.len(),
                "Open barrier had parked arrivals"
            );
        }

        tracing::debug!(required = count, "Barrier raised");
        self.raised = Some(Raised {
            required: count,
            reached: Some(reached),
        });
    }

    fn park(&mut self, id: ArrivalId, resume: oneshot::Sender<()>) {
        let Some(raised) = self.raised.as_mut() else {
            let _ = resume.send(());
            return;
        };

        let arrival = Arrival { id, resume };
        let duplicate = self.waitlist.iter().any(|a| a.id == id);

        if duplicate || self.waitlist.len() >= raised.required {
            if duplicate {
                tracing::warn!(id, "Arrival id already parked - not counted toward cohort");
            }
            self.overflow.push(arrival);
            return;
        }

        self.waitlist.push(arrival);
        tracing::trace!(id, parked = self.waitlist.len(), required = raised.required, "Arrival parked");

        if self.waitlist.len() == raised.required
            && let Some(reached) = raised.reached.take()
        {
            tracing::debug!(required = raised.required, "Barrier cohort complete");
            if reached.send(Ok(())).is_err() {
                tracing::warn!("Raiser stopped waiting before the cohort completed");
            }
        }
    }

    fn release(&mut self) {
        if let Some(raised) = self.raised.take()
            && let Some(reached) = raised.reached
        {
            tracing::error!(
                required = raised.required,
                parked = self.waitlist.len(),
                "Barrier released before the cohort completed"
            );
            let _ = reached.send(Err(Error::BarrierMisuse(format!(
                "released with {} of {} arrival(s) parked",
                self.waitlist.len(),
                raised.required
            ))));
        }

        let released = self.waitlist.len() + self.overflow.len();
        for arrival in self.waitlist.drain(..).chain(self.overflow.drain(..)) {
            let _ = arrival.resume.send(());
        }
        tracing::debug!(released, "Barrier released");
    }

    fn status(&self) -> BarrierStatus {
        BarrierStatus {
            mode: if self.raised.is_some() {
                GateMode::Raised
            } else {
                GateMode::Open
            },
            required: self.raised.as_ref().map(|r| r.required),
            parked: self.waitlist.iter().map(|a| a.id).collect(),
            overflow: self.overflow.iter().map(|a| a.id).collect(),
        }
    }
}

async fn run_gate(mut requests: mpsc::UnboundedReceiver<Request>, shutdown: CancellationToken) {
    let mut gate = Gate::default();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!("Barrier shutdown requested");
                break;
            }

            request = requests.recv() => match request {
                Some(request) => gate.handle(request),
                None => break,
            },
        }
    }

    // Dropping the gate drops every resume/reached sender; parked callers and
    // a waiting raiser observe the barrier as closed.
    let parked = gate.waitlist.len() + gate.overflow.len();
    if parked > 0 {
        tracing::info!(parked, "Barrier closing with parked arrivals");
    }
}

/// Two-state rendezvous gate.
///
/// Must be created within a Tokio runtime; its coordination task runs there.
pub struct Barrier {
    requests: mpsc::UnboundedSender<Request>,
    shutdown: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Barrier {
    pub fn new() -> Self {
        let (requests, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_gate(rx, shutdown.clone()));

        Self {
            requests,
            shutdown,
            task: StdMutex::new(Some(task)),
        }
    }

    fn send(&self, request: Request) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShutdownInProgress);
        }
        self.requests
            .send(request)
            .map_err(|_| Error::ShutdownInProgress)
    }

    /// Reader checkpoint: pass straight through when open, otherwise park
    /// until `release`.
    ///
    /// Returns `ShutdownInProgress` if the barrier closes while parked.
    pub async fn park_if_raised(&self, id: ArrivalId) -> Result<()> {
        let (resume, resumed) = oneshot::channel();
        self.send(Request::Park { id, resume })?;
        resumed.await.map_err(|_| Error::ShutdownInProgress)
    }

    /// Raise the barrier and wait until `count` distinct arrivals are parked.
    ///
    /// A count of zero returns immediately without raising. The parked cohort
    /// stays parked after this returns; call `release` to let it go.
    pub async fn raise_and_wait(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let (reached, cohort) = oneshot::channel();
        self.send(Request::Raise { count, reached })?;
        cohort.await.map_err(|_| Error::ShutdownInProgress)?
    }

    /// Unpark every parked arrival and return to open.
    ///
    /// Everything parked when this is processed has been resumed by the time
    /// it returns.
    pub async fn release(&self) -> Result<()> {
        let (done, released) = oneshot::channel();
        self.send(Request::Release { done })?;
        released.await.map_err(|_| Error::ShutdownInProgress)
    }

    pub async fn status(&self) -> Result<BarrierStatus> {
        let (reply, status) = oneshot::channel();
        self.send(Request::Status { reply })?;
        status.await.map_err(|_| Error::ShutdownInProgress)
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the coordination task, waking every parked caller with
    /// `ShutdownInProgress`.
    pub async fn close(&self) -> Result<()> {
        let task = match self.task.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(task) = task else {
            return Err(Error::ShutdownInProgress);
        };

        self.shutdown.cancel();
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Barrier task failed");
        }
        tracing::debug!("Barrier closed");
        Ok(())
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        let unclosed = match self.task.get_mut() {
            Ok(task) => task.is_some(),
            Err(mut poisoned) => poisoned.get_mut().is_some(),
        };
        if unclosed {
            tracing::warn!("Barrier dropped without close - waking parked arrivals");
        }
        self.shutdown.cancel();
    }
}
