//! Periodic CHSH harness.
//!
//! A [`Harness`] is a handle to one control thread. The control thread owns
//! every piece of harness state and is the only place it changes; the handle
//! talks to it through a command channel, and the isolated executor talks to it
//! through the same channel. No locks guard harness state.
//!
//! States are `Stopped` and `Running(interval)`:
//!
//! - `start` runs one batch immediately, then arms the timer.
//! - `set_interval` rearms at `max(ms, 10 000)` without an extra batch.
//! - `stop` disarms the timer and terminates the executor. Idempotent.
//!
//! Each tick sends a quantum batch to the executor and moves on without waiting.
//! Under [`StaleResultPolicy::Discard`] a tick is skipped while the previous
//! periodic batch is still on the executor.
//! When no executor can be had, the tick runs a smaller batch on the control
//! thread itself and tags the outcome [`ResultOrigin::Degraded`].

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::bus::{EventBus, TOPIC_STATISTIC};
use crate::config::{HarnessConfig, StaleResultPolicy, clamp_interval};
use crate::engine::{TSIRELSON_BOUND, TrialBatchResult, TrialEngine, TrialMode};
use crate::error::{ExecutorError, HarnessError};
use crate::executor::{Deliver, ExecutorEvent, IsolatedExecutor, Launcher, ThreadLauncher};
use crate::protocol::{self, BatchReply, WorkerRequest, WorkerResponse};

/// Where a result was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultOrigin {
    /// On the isolated executor at full trial count.
    Isolated,
    /// On the control thread at the reduced trial count.
    Degraded,
}

impl std::fmt::Display for ResultOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Isolated => write!(f, "isolated"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// A batch result tagged with its request sequence and origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub sequence: u64,
    pub origin: ResultOrigin,
    pub result: TrialBatchResult,
}

/// Snapshot of harness state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessState {
    pub is_running: bool,
    pub current_interval_ms: u64,
    pub last_result: Option<BatchOutcome>,
    pub executor_available: bool,
    /// The executor's worker thread is still running.
    pub executor_live: bool,
    pub timer_armed: bool,
    /// Supremacy comparisons waiting on the executor.
    pub pending_comparisons: usize,
    pub batches_issued: u64,
    pub batches_completed: u64,
    pub degraded_batches: u64,
    pub stale_discarded: u64,
    /// Ticks that found the previous periodic batch still running.
    pub skipped_ticks: u64,
}

/// Side-by-side quantum and classical runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupremacyReport {
    pub quantum: BatchOutcome,
    pub classical: BatchOutcome,
    /// `S_quantum − S_classical`.
    pub advantage: f64,
}

impl SupremacyReport {
    fn new(quantum: BatchOutcome, classical: BatchOutcome) -> Self {
        let advantage = quantum.result.statistic - classical.result.statistic;
        Self {
            quantum,
            classical,
            advantage,
        }
    }
}

type SupremacyReply = Sender<Result<SupremacyReport, HarnessError>>;

enum Command {
    Start(Sender<()>),
    Stop(Sender<()>),
    SetInterval(u64, Sender<u64>),
    Supremacy(SupremacyReply),
    State(Sender<HarnessState>),
    Recent(Sender<Vec<BatchOutcome>>),
    Executor(ExecutorEvent),
    Shutdown,
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Owned handle to one harness instance.
///
/// Dropping the handle stops the harness and joins its control thread.
pub struct Harness {
    commands: Sender<Command>,
    control: Option<JoinHandle<()>>,
}

impl Harness {
    /// Create a stopped harness that isolates batches on a worker thread.
    pub fn new<B: EventBus>(config: HarnessConfig, bus: B) -> Result<Self, HarnessError> {
        Self::with_launcher(config, bus, ThreadLauncher)
    }

    /// Create a stopped harness with a custom executor launcher.
    pub fn with_launcher<B, L>(config: HarnessConfig, bus: B, launcher: L) -> Result<Self, HarnessError>
    where
        B: EventBus,
        L: Launcher,
    {
        let config = config.validate()?;
        let (commands, inbox) = mpsc::channel();
        let orchestrator =
            Orchestrator::new(config, Box::new(bus), Box::new(launcher), commands.clone());
        let control = thread::Builder::new()
            .name("chsh-harness".to_string())
            .spawn(move || orchestrator.run(inbox))
            .map_err(HarnessError::Spawn)?;
        Ok(Self {
            commands,
            control: Some(control),
        })
    }

    /// `Stopped → Running`. Runs one batch now, then every interval.
    pub fn start(&self) -> Result<(), HarnessError> {
        self.request(Command::Start)
    }

    /// Disarm the timer and terminate the executor.
    pub fn stop(&self) -> Result<(), HarnessError> {
        self.request(Command::Stop)
    }

    /// Change the cadence. Returns the interval actually in effect.
    pub fn set_interval(&self, interval_ms: u64) -> Result<u64, HarnessError> {
        self.request(|ack| Command::SetInterval(interval_ms, ack))
    }

    /// Run a quantum and a classical batch back to back and compare them.
    ///
    /// Blocks the caller, not the harness. Results are returned, not published.
    pub fn run_supremacy_test(&self) -> Result<SupremacyReport, HarnessError> {
        self.request(Command::Supremacy)?
    }

    /// The statistic of the latest applied result.
    pub fn current_statistic(&self) -> Result<Option<f64>, HarnessError> {
        Ok(self.state()?.last_result.map(|o| o.result.statistic))
    }

    pub fn state(&self) -> Result<HarnessState, HarnessError> {
        self.request(Command::State)
    }

    /// The in-memory recent window, oldest first.
    pub fn recent_results(&self) -> Result<Vec<BatchOutcome>, HarnessError> {
        self.request(Command::Recent)
    }

    fn request<T>(&self, build: impl FnOnce(Sender<T>) -> Command) -> Result<T, HarnessError> {
        let (tx, rx) = mpsc::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| HarnessError::ControlUnavailable)?;
        rx.recv().map_err(|_| HarnessError::ControlUnavailable)
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(control) = self.control.take()
            && control.join().is_err()
        {
            log::error!("harness control thread panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Control thread
// ---------------------------------------------------------------------------

struct Comparison {
    quantum_sequence: u64,
    classical_sequence: u64,
    quantum: Option<BatchOutcome>,
    classical: Option<BatchOutcome>,
    reply: SupremacyReply,
}

struct Orchestrator {
    config: HarnessConfig,
    bus: Box<dyn EventBus>,
    launcher: Box<dyn Launcher>,
    inbox: Sender<Command>,
    fallback: TrialEngine,

    executor: Option<IsolatedExecutor>,
    next_executor_id: u64,
    degraded: bool,
    /// Degraded periodic batches since the executor was last up.
    degraded_streak: u64,

    running: bool,
    interval: Duration,
    next_tick: Option<Instant>,

    sequence: u64,
    latest_periodic: Option<u64>,
    in_flight: Vec<u64>,
    comparisons: Vec<Comparison>,

    last_result: Option<BatchOutcome>,
    recent: VecDeque<BatchOutcome>,
    batches_issued: u64,
    batches_completed: u64,
    degraded_batches: u64,
    stale_discarded: u64,
    skipped_ticks: u64,
}

impl Orchestrator {
    fn new(
        config: HarnessConfig,
        bus: Box<dyn EventBus>,
        launcher: Box<dyn Launcher>,
        inbox: Sender<Command>,
    ) -> Self {
        let fallback = TrialEngine::new(config.settings);
        let interval = config.interval();
        Self {
            config,
            bus,
            launcher,
            inbox,
            fallback,
            executor: None,
            next_executor_id: 0,
            degraded: false,
            degraded_streak: 0,
            running: false,
            interval,
            next_tick: None,
            sequence: 0,
            latest_periodic: None,
            in_flight: Vec::new(),
            comparisons: Vec::new(),
            last_result: None,
            recent: VecDeque::new(),
            batches_issued: 0,
            batches_completed: 0,
            degraded_batches: 0,
            stale_discarded: 0,
            skipped_ticks: 0,
        }
    }

    fn run(mut self, inbox: Receiver<Command>) {
        loop {
            let command = match self.next_tick {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    match inbox.recv_timeout(wait) {
                        Ok(command) => command,
                        Err(RecvTimeoutError::Timeout) => {
                            self.on_timer();
                            continue;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                None => match inbox.recv() {
                    Ok(command) => command,
                    Err(_) => break,
                },
            };
            if !self.handle(command) {
                break;
            }
        }
        self.stop();
        log::debug!("harness control thread exiting");
    }

    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Start(ack) => {
                self.start();
                let _ = ack.send(());
            }
            Command::Stop(ack) => {
                self.stop();
                let _ = ack.send(());
            }
            Command::SetInterval(interval_ms, ack) => {
                let effective = self.set_interval(interval_ms);
                let _ = ack.send(effective);
            }
            Command::Supremacy(reply) => self.begin_comparison(reply),
            Command::State(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Recent(reply) => {
                let _ = reply.send(self.recent.iter().cloned().collect());
            }
            Command::Executor(event) => self.on_executor_event(event),
            Command::Shutdown => return false,
        }
        true
    }

    // -- state machine ------------------------------------------------------

    fn start(&mut self) {
        if self.running {
            log::debug!("harness already running");
            return;
        }
        self.running = true;
        log::info!(
            "harness started: interval {} ms, {} trials per batch",
            self.interval.as_millis(),
            self.config.isolated_trials
        );
        self.run_periodic_batch();
        self.next_tick = Some(Instant::now() + self.interval);
    }

    fn stop(&mut self) {
        let was_running = self.running;
        self.running = false;
        self.next_tick = None;
        self.in_flight.clear();
        for comparison in self.comparisons.drain(..) {
            let _ = comparison.reply.send(Err(HarnessError::Cancelled));
        }
        self.discard_executor();
        if was_running {
            log::info!("harness stopped");
        }
    }

    fn set_interval(&mut self, interval_ms: u64) -> u64 {
        let effective = clamp_interval(interval_ms);
        self.interval = Duration::from_millis(effective);
        if self.running {
            self.next_tick = Some(Instant::now() + self.interval);
        }
        log::debug!("interval set to {effective} ms");
        effective
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        match self.next_tick {
            Some(deadline) if now >= deadline => {
                self.next_tick = Some(now + self.interval);
                if self.periodic_outstanding() {
                    self.skipped_ticks += 1;
                    log::debug!(
                        "tick skipped: batch {:?} still running on the executor",
                        self.latest_periodic
                    );
                } else {
                    self.run_periodic_batch();
                }
            }
            _ => {}
        }
    }

    /// Under `Discard`, a newer request would make the running one stale
    /// before it lands, so ticks wait for it instead of queueing behind it.
    fn periodic_outstanding(&self) -> bool {
        self.config.stale_results == StaleResultPolicy::Discard
            && self
                .latest_periodic
                .is_some_and(|latest| self.in_flight.contains(&latest))
    }

    fn snapshot(&self) -> HarnessState {
        HarnessState {
            is_running: self.running,
            current_interval_ms: self.interval.as_millis() as u64,
            last_result: self.last_result.clone(),
            executor_available: self.executor.is_some(),
            executor_live: self.executor.as_ref().is_some_and(IsolatedExecutor::is_alive),
            timer_armed: self.next_tick.is_some(),
            pending_comparisons: self.comparisons.len(),
            batches_issued: self.batches_issued,
            batches_completed: self.batches_completed,
            degraded_batches: self.degraded_batches,
            stale_discarded: self.stale_discarded,
            skipped_ticks: self.skipped_ticks,
        }
    }

    // -- executor management ------------------------------------------------

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn ensure_executor(&mut self) {
        if self.executor.is_some() {
            return;
        }
        self.next_executor_id += 1;
        let id = self.next_executor_id;
        let inbox = self.inbox.clone();
        let deliver: Deliver = Box::new(move |event| {
            let _ = inbox.send(Command::Executor(event));
        });
        match self.launcher.launch(id, &self.config.settings, deliver) {
            Ok(executor) => {
                if self.degraded {
                    log::info!("executor {id} started; leaving degraded mode");
                } else {
                    log::debug!("executor {id} started");
                }
                self.degraded = false;
                self.degraded_streak = 0;
                self.executor = Some(executor);
            }
            Err(e) => {
                if self.degraded {
                    log::debug!("executor still unavailable: {e}");
                } else {
                    log::warn!("isolated executor unavailable, running degraded batches: {e}");
                }
                self.degraded = true;
            }
        }
    }

    /// Send a request to the executor, creating it if needed. False means the
    /// caller must fall back.
    fn submit(&mut self, request: &WorkerRequest) -> bool {
        self.ensure_executor();
        let Some(executor) = &self.executor else {
            return false;
        };
        match executor.submit(request) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("executor {} rejected request: {e}", executor.id());
                self.discard_executor();
                self.degraded = true;
                false
            }
        }
    }

    fn discard_executor(&mut self) {
        if let Some(executor) = self.executor.take() {
            let id = executor.id();
            executor.terminate();
            log::debug!("executor {id} terminated");
        }
    }

    fn on_executor_event(&mut self, event: ExecutorEvent) {
        let current = self.executor.as_ref().map(IsolatedExecutor::id);
        if current != Some(event.executor()) {
            log::trace!("ignoring event from retired executor {}", event.executor());
            return;
        }
        match event {
            ExecutorEvent::Exited { reason, .. } => {
                self.on_executor_failure(&ExecutorError::Worker(reason))
            }
            ExecutorEvent::Frame { frame, .. } => match protocol::decode::<WorkerResponse>(&frame) {
                Ok(response) => self.on_response(response),
                Err(e) => self.on_executor_failure(&e),
            },
        }
    }

    fn on_response(&mut self, response: WorkerResponse) {
        match response {
            WorkerResponse::Ready => log::debug!("executor ready"),
            WorkerResponse::Progress(report) => log::trace!(
                "batch {}: {}/{} trials, S≈{:.4}",
                report.sequence,
                report.progress.completed,
                report.progress.total,
                report.progress.partial_statistic
            ),
            WorkerResponse::ChshResult(reply) => self.on_batch_reply(TrialMode::Quantum, reply),
            WorkerResponse::ClassicalResult(reply) => {
                self.on_batch_reply(TrialMode::Classical, reply)
            }
            WorkerResponse::Error(fault) => {
                let message = match fault.sequence {
                    Some(sequence) => format!("batch {sequence}: {}", fault.message),
                    None => fault.message,
                };
                self.on_executor_failure(&ExecutorError::Worker(message));
            }
        }
    }

    fn on_batch_reply(&mut self, mode: TrialMode, reply: BatchReply) {
        let outcome = BatchOutcome {
            sequence: reply.sequence,
            origin: ResultOrigin::Isolated,
            result: reply.result,
        };
        let Some(outcome) = self.fill_comparison(outcome) else {
            return;
        };
        self.in_flight.retain(|&s| s != outcome.sequence);
        match mode {
            TrialMode::Quantum => self.accept_periodic(outcome),
            TrialMode::Classical => log::info!(
                "unsolicited classical result S={:.4} (batch {}) not published",
                outcome.result.statistic,
                outcome.sequence
            ),
        }
    }

    /// Isolation-runtime-failure: discard the executor, finish whatever was
    /// waiting on it in degraded mode, and retry creation on the next tick.
    fn on_executor_failure(&mut self, error: &ExecutorError) {
        log::warn!("isolated executor failed, falling back to degraded mode: {error}");
        self.discard_executor();
        self.degraded = true;

        for comparison in std::mem::take(&mut self.comparisons) {
            let report =
                self.degraded_comparison(comparison.quantum_sequence, comparison.classical_sequence);
            let _ = comparison.reply.send(Ok(report));
        }

        let lost = std::mem::take(&mut self.in_flight);
        if self.running
            && let Some(latest) = self.latest_periodic
            && lost.contains(&latest)
        {
            self.run_degraded_periodic(latest);
        }
    }

    // -- periodic batches ---------------------------------------------------

    fn run_periodic_batch(&mut self) {
        let sequence = self.next_sequence();
        self.batches_issued += 1;
        self.latest_periodic = Some(sequence);

        let request = WorkerRequest::batch(TrialMode::Quantum, self.config.isolated_trials, sequence);
        if self.submit(&request) {
            self.in_flight.push(sequence);
        } else {
            self.run_degraded_periodic(sequence);
        }
    }

    fn run_degraded_periodic(&mut self, sequence: u64) {
        log::log!(
            self.degraded_log_level(),
            "batch {sequence}: running {} trials in degraded mode",
            self.config.degraded_trials
        );
        self.degraded_streak += 1;
        let result = self
            .fallback
            .run_batch(self.config.degraded_trials, TrialMode::Quantum);
        self.degraded_batches += 1;
        self.accept_periodic(BatchOutcome {
            sequence,
            origin: ResultOrigin::Degraded,
            result,
        });
    }

    /// Info for the first degraded batch after losing the executor, debug after.
    fn degraded_log_level(&self) -> log::Level {
        if self.degraded_streak == 0 {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }

    fn accept_periodic(&mut self, outcome: BatchOutcome) {
        if !self.running {
            log::debug!("ignoring batch {} after stop", outcome.sequence);
            return;
        }
        if self.config.stale_results == StaleResultPolicy::Discard
            && self.latest_periodic != Some(outcome.sequence)
        {
            self.stale_discarded += 1;
            log::debug!(
                "discarding stale batch {} (latest is {:?})",
                outcome.sequence,
                self.latest_periodic
            );
            return;
        }
        self.apply(outcome);
    }

    fn apply(&mut self, outcome: BatchOutcome) {
        let result = &outcome.result;
        if result.mode == TrialMode::Quantum && !result.within_physical_limit {
            log::error!(
                "engine defect: batch {} produced S={:.4} beyond the physical limit {:.4} ({} trials)",
                outcome.sequence,
                result.statistic,
                TSIRELSON_BOUND,
                result.trial_count
            );
        }
        log::debug!(
            "batch {} ({}) S={:.4} sigma={:.1}",
            outcome.sequence,
            outcome.origin,
            result.statistic,
            result.confidence_sigma
        );

        self.batches_completed += 1;
        self.bus.publish_outcome(TOPIC_STATISTIC, &outcome);
        self.recent.push_back(outcome.clone());
        while self.recent.len() > self.config.history_len {
            self.recent.pop_front();
        }
        self.last_result = Some(outcome);
    }

    // -- supremacy comparisons ----------------------------------------------

    fn begin_comparison(&mut self, reply: SupremacyReply) {
        let trials = self.config.supremacy_trials;
        let quantum_sequence = self.next_sequence();
        let classical_sequence = self.next_sequence();

        let quantum = WorkerRequest::batch(TrialMode::Quantum, trials, quantum_sequence);
        let classical = WorkerRequest::batch(TrialMode::Classical, trials, classical_sequence);
        if self.submit(&quantum) && self.submit(&classical) {
            self.comparisons.push(Comparison {
                quantum_sequence,
                classical_sequence,
                quantum: None,
                classical: None,
                reply,
            });
            return;
        }

        let report = self.degraded_comparison(quantum_sequence, classical_sequence);
        let _ = reply.send(Ok(report));
    }

    /// Route an outcome to a pending comparison. Returns it back if it belongs
    /// to none.
    fn fill_comparison(&mut self, outcome: BatchOutcome) -> Option<BatchOutcome> {
        let Some(index) = self.comparisons.iter().position(|c| {
            c.quantum_sequence == outcome.sequence || c.classical_sequence == outcome.sequence
        }) else {
            return Some(outcome);
        };

        let comparison = &mut self.comparisons[index];
        if comparison.quantum_sequence == outcome.sequence {
            comparison.quantum = Some(outcome);
        } else {
            comparison.classical = Some(outcome);
        }

        if comparison.quantum.is_some() && comparison.classical.is_some() {
            let comparison = self.comparisons.swap_remove(index);
            if let (Some(quantum), Some(classical)) = (comparison.quantum, comparison.classical) {
                let report = SupremacyReport::new(quantum, classical);
                log_comparison(&report);
                let _ = comparison.reply.send(Ok(report));
            }
            if !self.running && self.comparisons.is_empty() {
                self.discard_executor();
            }
        }
        None
    }

    fn degraded_comparison(&mut self, quantum_sequence: u64, classical_sequence: u64) -> SupremacyReport {
        let trials = self.config.degraded_trials;
        log::debug!("running supremacy comparison in degraded mode ({trials} trials each)");
        let quantum = self.fallback.run_batch(trials, TrialMode::Quantum);
        let classical = self.fallback.run_batch(trials, TrialMode::Classical);
        let report = SupremacyReport::new(
            BatchOutcome {
                sequence: quantum_sequence,
                origin: ResultOrigin::Degraded,
                result: quantum,
            },
            BatchOutcome {
                sequence: classical_sequence,
                origin: ResultOrigin::Degraded,
                result: classical,
            },
        );
        log_comparison(&report);
        report
    }
}

fn log_comparison(report: &SupremacyReport) {
    log::info!(
        "supremacy comparison ({}): quantum S={:.4}, classical S={:.4}, advantage {:.4}",
        report.quantum.origin,
        report.quantum.result.statistic,
        report.classical.result.statistic,
        report.advantage
    );
}
