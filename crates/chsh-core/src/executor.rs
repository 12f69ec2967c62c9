//! Isolated executor: a dedicated worker thread hosting its own trial engine.
//!
//! The worker shares no mutable state with its owner. Requests go in as JSON
//! frames over a channel; responses come back as JSON frames through a
//! [`Deliver`] callback supplied by the owner. The worker owns its engine and
//! its copy of the settings, nothing else.
//!
//! Lifecycle:
//! 1. [`IsolatedExecutor::start`] spawns the thread; the worker announces
//!    itself with a `ready` frame.
//! 2. [`IsolatedExecutor::submit`] queues a request without waiting.
//! 3. The worker answers with `progress` frames every sub-batch and one final
//!    `chshResult` / `classicalResult` (or `error`).
//! 4. [`IsolatedExecutor::terminate`] queues `shutdown` and joins the thread.
//!    A running batch notices the shutdown at its next sub-batch boundary.
//!
//! Panics inside the worker are caught at the thread boundary and reported as
//! [`ExecutorEvent::Exited`].

use std::any::Any;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};

use rand::Rng;

use crate::engine::{MeasurementSettings, TrialEngine, TrialMode};
use crate::error::ExecutorError;
use crate::protocol::{
    self, BatchReply, ProgressReport, WorkerFault, WorkerRequest, WorkerResponse,
};

/// Callback through which a worker hands events to its owner.
pub type Deliver = Box<dyn Fn(ExecutorEvent) + Send + 'static>;

/// Something that happened on the worker side, tagged with the executor id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorEvent {
    /// A serialized [`WorkerResponse`].
    Frame { executor: u64, frame: String },
    /// The worker died abnormally.
    Exited { executor: u64, reason: String },
}

impl ExecutorEvent {
    pub fn executor(&self) -> u64 {
        match self {
            Self::Frame { executor, .. } | Self::Exited { executor, .. } => *executor,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker side
// ---------------------------------------------------------------------------

/// Worker-side sender of responses.
pub struct Outbox {
    executor: u64,
    deliver: Deliver,
}

impl Outbox {
    pub fn send(&self, response: &WorkerResponse) {
        match protocol::encode(response) {
            Ok(frame) => (self.deliver)(ExecutorEvent::Frame {
                executor: self.executor,
                frame,
            }),
            Err(e) => log::error!("executor {}: cannot encode response: {e}", self.executor),
        }
    }

    fn exited(&self, reason: String) {
        (self.deliver)(ExecutorEvent::Exited {
            executor: self.executor,
            reason,
        });
    }
}

/// Worker-side request inbox.
pub struct Mailbox {
    executor: u64,
    frames: Receiver<String>,
    backlog: VecDeque<String>,
}

impl Mailbox {
    fn new(executor: u64, frames: Receiver<String>) -> Self {
        Self {
            executor,
            frames,
            backlog: VecDeque::new(),
        }
    }

    /// Block for the next request. `None` once the owner has hung up.
    pub fn next(&mut self) -> Option<Result<WorkerRequest, ExecutorError>> {
        let frame = match self.backlog.pop_front() {
            Some(frame) => frame,
            None => self.frames.recv().ok()?,
        };
        Some(protocol::decode(&frame))
    }

    /// Non-blocking: true if a shutdown is queued or the owner is gone.
    ///
    /// Other queued requests are kept, in order, for [`next`](Self::next).
    pub fn shutdown_requested(&mut self) -> bool {
        loop {
            match self.frames.try_recv() {
                Ok(frame) => {
                    if matches!(
                        protocol::decode::<WorkerRequest>(&frame),
                        Ok(WorkerRequest::Shutdown)
                    ) {
                        return true;
                    }
                    self.backlog.push_back(frame);
                }
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => {
                    log::debug!("executor {}: owner hung up mid-batch", self.executor);
                    return true;
                }
            }
        }
    }
}

/// Trial-engine worker loop.
///
/// Runs until a `shutdown` request arrives or the owner disconnects.
pub fn serve<R: Rng>(mut engine: TrialEngine<R>, mailbox: &mut Mailbox, outbox: &Outbox) {
    outbox.send(&WorkerResponse::Ready);

    while let Some(next) = mailbox.next() {
        let request = match next {
            Ok(request) => request,
            Err(e) => {
                outbox.send(&WorkerResponse::Error(WorkerFault {
                    sequence: None,
                    message: e.to_string(),
                }));
                continue;
            }
        };

        let (mode, batch) = match request {
            WorkerRequest::Shutdown => return,
            WorkerRequest::RunQuantum(batch) => (TrialMode::Quantum, batch),
            WorkerRequest::RunClassical(batch) => (TrialMode::Classical, batch),
        };

        if batch.num_trials == 0 {
            outbox.send(&WorkerResponse::Error(WorkerFault {
                sequence: Some(batch.sequence),
                message: "numTrials must be positive".to_string(),
            }));
            continue;
        }

        let result = engine.run_batch_with(batch.num_trials, mode, |progress| {
            outbox.send(&WorkerResponse::Progress(ProgressReport {
                sequence: batch.sequence,
                progress,
            }));
            if mailbox.shutdown_requested() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        let Some(result) = result else {
            log::debug!(
                "executor {}: batch {} abandoned on shutdown",
                mailbox.executor,
                batch.sequence
            );
            return;
        };

        let reply = BatchReply {
            sequence: batch.sequence,
            result,
        };
        outbox.send(&match mode {
            TrialMode::Quantum => WorkerResponse::ChshResult(reply),
            TrialMode::Classical => WorkerResponse::ClassicalResult(reply),
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

// ---------------------------------------------------------------------------
// Owner side
// ---------------------------------------------------------------------------

/// Owner-side handle to one isolated worker.
pub struct IsolatedExecutor {
    id: u64,
    requests: Option<Sender<String>>,
    handle: Option<JoinHandle<()>>,
}

impl IsolatedExecutor {
    /// Spawn a worker running [`serve`] over a freshly seeded engine.
    pub fn start(
        id: u64,
        settings: MeasurementSettings,
        deliver: Deliver,
    ) -> Result<Self, ExecutorError> {
        Self::spawn_worker(id, deliver, move |mailbox, outbox| {
            serve(TrialEngine::new(settings), mailbox, outbox);
        })
    }

    /// Spawn an arbitrary worker body behind the same framed boundary.
    pub fn spawn_worker<W>(id: u64, deliver: Deliver, worker: W) -> Result<Self, ExecutorError>
    where
        W: FnOnce(&mut Mailbox, &Outbox) + Send + 'static,
    {
        let (requests, frames) = mpsc::channel::<String>();
        let handle = thread::Builder::new()
            .name(format!("chsh-executor-{id}"))
            .spawn(move || {
                let outbox = Outbox {
                    executor: id,
                    deliver,
                };
                let mut mailbox = Mailbox::new(id, frames);
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| worker(&mut mailbox, &outbox)));
                if let Err(payload) = outcome {
                    outbox.exited(panic_message(payload.as_ref()));
                }
            })
            .map_err(ExecutorError::Spawn)?;

        Ok(Self {
            id,
            requests: Some(requests),
            handle: Some(handle),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue a request. Never waits for the worker.
    pub fn submit(&self, request: &WorkerRequest) -> Result<(), ExecutorError> {
        let frame = protocol::encode(request)?;
        let requests = self.requests.as_ref().ok_or(ExecutorError::Disconnected)?;
        requests
            .send(frame)
            .map_err(|_| ExecutorError::Disconnected)
    }

    /// True while the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the worker to stop and wait for its thread to exit.
    pub fn terminate(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(requests) = self.requests.take()
            && let Ok(frame) = protocol::encode(&WorkerRequest::Shutdown)
        {
            // The worker may already be gone.
            let _ = requests.send(frame);
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::warn!("executor {}: worker thread panicked during shutdown", self.id);
        }
    }
}

impl Drop for IsolatedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Launchers
// ---------------------------------------------------------------------------

/// Creates isolated executors for the harness.
pub trait Launcher: Send + 'static {
    fn launch(
        &mut self,
        id: u64,
        settings: &MeasurementSettings,
        deliver: Deliver,
    ) -> Result<IsolatedExecutor, ExecutorError>;
}

/// Default launcher: one OS thread per executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadLauncher;

impl Launcher for ThreadLauncher {
    fn launch(
        &mut self,
        id: u64,
        settings: &MeasurementSettings,
        deliver: Deliver,
    ) -> Result<IsolatedExecutor, ExecutorError> {
        IsolatedExecutor::start(id, *settings, deliver)
    }
}

/// A launcher for environments without isolation. Always fails, which keeps
/// the harness permanently in degraded mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIsolation;

impl Launcher for NoIsolation {
    fn launch(
        &mut self,
        _id: u64,
        _settings: &MeasurementSettings,
        _deliver: Deliver,
    ) -> Result<IsolatedExecutor, ExecutorError> {
        Err(ExecutorError::Unavailable("isolation disabled".to_string()))
    }
}

impl<F> Launcher for F
where
    F: FnMut(u64, &MeasurementSettings, Deliver) -> Result<IsolatedExecutor, ExecutorError>
        + Send
        + 'static,
{
    fn launch(
        &mut self,
        id: u64,
        settings: &MeasurementSettings,
        deliver: Deliver,
    ) -> Result<IsolatedExecutor, ExecutorError> {
        self(id, settings, deliver)
    }
}
