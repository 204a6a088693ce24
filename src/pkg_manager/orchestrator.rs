//! Supervises one resolved package manager through its lifecycle.
//!
//! ```text
//! Idle ─start─► Startup(CreateContext ─► SetupLifecycle) ─► Working ─► Idle
//!   │                    │                      │              │
//!   └──── halt/abort ────┴──────────────────────┴──────────────┘
//!                                  ▼
//!         Shutdown(Gate ─► DestroyContext ─► TeardownLifecycle) ─► Done
//! ```
//!
//! The machine runs as a single tokio task that owns all of its state.
//! [`OrchestratorHandle`] talks to it over a command channel.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};

use super::abort::{AbortController, AbortSignal};
use super::context::{self, ContextOptions, ExecutionContext};
use super::envelope::PackageManagerEnvelope;
use super::executor::Executor;
use super::fs::FileManager;
use super::hooks;
use super::worker::{self, BatchReport, OrchestratorEvent, WorkerShared};
use crate::error::{ContextError, LifecycleError, LifecycleStage, MachineError, MachineFailure};
use crate::ui::debug;
use crate::workspace::WorkspaceInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
    CreateContext,
    SetupLifecycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    Gate,
    DestroyContext,
    TeardownLifecycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorPhase {
    Idle,
    Startup(StartupStep),
    Working {
        packing_done: bool,
        installing_done: bool,
    },
    Shutdown(ShutdownStep),
    Done,
}

impl OrchestratorPhase {
    const WORKING: OrchestratorPhase = OrchestratorPhase::Working {
        packing_done: false,
        installing_done: false,
    };

    pub fn can_transition_to(self, next: OrchestratorPhase) -> bool {
        use OrchestratorPhase::*;
        use ShutdownStep::*;
        use StartupStep::*;
        match (self, next) {
            (Idle, Startup(CreateContext) | Working { .. } | Shutdown(Gate)) => true,
            (Startup(CreateContext), Startup(SetupLifecycle) | Shutdown(Gate) | Done) => true,
            (Startup(SetupLifecycle), Working { .. } | Shutdown(Gate)) => true,
            (Working { .. }, Working { .. } | Shutdown(Gate)) => true,
            // Back to idle only once both regions are finished
            (
                Working {
                    packing_done: true,
                    installing_done: true,
                },
                Idle,
            ) => true,
            (Shutdown(Gate), Shutdown(DestroyContext) | Done) => true,
            (Shutdown(DestroyContext), Shutdown(TeardownLifecycle)) => true,
            (Shutdown(TeardownLifecycle), Done) => true,
            _ => false,
        }
    }

    pub fn is_done(self) -> bool {
        self == OrchestratorPhase::Done
    }
}

impl fmt::Display for OrchestratorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorPhase::Idle => write!(f, "idle"),
            OrchestratorPhase::Startup(StartupStep::CreateContext) => write!(f, "startup.createContext"),
            OrchestratorPhase::Startup(StartupStep::SetupLifecycle) => write!(f, "startup.setupLifecycle"),
            OrchestratorPhase::Working {
                packing_done,
                installing_done,
            } => write!(
                f,
                "working(packing: {}, installing: {})",
                if *packing_done { "done" } else { "running" },
                if *installing_done { "done" } else { "running" }
            ),
            OrchestratorPhase::Shutdown(ShutdownStep::Gate) => write!(f, "shutdown.gate"),
            OrchestratorPhase::Shutdown(ShutdownStep::DestroyContext) => write!(f, "shutdown.destroyContext"),
            OrchestratorPhase::Shutdown(ShutdownStep::TeardownLifecycle) => {
                write!(f, "shutdown.teardownLifecycle")
            }
            OrchestratorPhase::Done => write!(f, "done"),
        }
    }
}

/// Terminal output of an orchestrator.
#[derive(Debug)]
pub struct OrchestratorOutcome {
    pub machine_id: String,
    pub aborted: bool,
    /// The orchestrator never received any workspaces.
    pub noop: bool,
    pub error: Option<MachineError>,
    /// Temp directory kept because of `linger`.
    pub lingering: Option<PathBuf>,
}

#[derive(Clone)]
pub struct OrchestratorOptions {
    pub context: ContextOptions,
    /// Give up when no workspaces arrive within this long.
    pub idle_timeout: Option<Duration>,
    /// External abort, handled like [`OrchestratorHandle::abort`].
    pub signal: AbortSignal,
    pub events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
    /// Workspaces to start with right away.
    pub workspaces: Vec<WorkspaceInfo>,
    /// Scripts to run in every installed package.
    pub scripts: Vec<String>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            context: ContextOptions::default(),
            idle_timeout: None,
            signal: AbortSignal::never(),
            events: None,
            workspaces: Vec::new(),
            scripts: Vec::new(),
        }
    }
}

struct Batch {
    workspaces: Vec<WorkspaceInfo>,
    scripts: Vec<String>,
    reply: Option<oneshot::Sender<BatchReport>>,
}

enum Command {
    Start(Batch),
    Halt,
}

/// Resolves once the batch it was issued for has finished working.
#[derive(Debug)]
pub struct BatchTicket {
    rx: oneshot::Receiver<BatchReport>,
}

impl BatchTicket {
    /// `None` if the batch never ran, e.g. the orchestrator shut down first.
    pub async fn wait(self) -> Option<BatchReport> {
        self.rx.await.ok()
    }
}

pub struct OrchestratorHandle {
    machine_id: String,
    commands: mpsc::UnboundedSender<Command>,
    abort: Arc<AbortController>,
    phase: watch::Receiver<OrchestratorPhase>,
    task: JoinHandle<OrchestratorOutcome>,
}

impl OrchestratorHandle {
    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    /// Queue a batch of workspaces.
    pub fn start(&self, workspaces: Vec<WorkspaceInfo>) -> BatchTicket {
        self.start_with_scripts(workspaces, Vec::new())
    }

    pub fn start_with_scripts(&self, workspaces: Vec<WorkspaceInfo>, scripts: Vec<String>) -> BatchTicket {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(Command::Start(Batch {
            workspaces,
            scripts,
            reply: Some(tx),
        }));
        BatchTicket { rx }
    }

    /// Stop the current batch's workers and shut down without marking the
    /// run as aborted.
    pub fn halt(&self) {
        let _ = self.commands.send(Command::Halt);
    }

    /// Stop everything now and shut down. Safe to call repeatedly, also
    /// after the orchestrator is done.
    pub fn abort(&self) {
        if self.abort.abort() {
            debug(
                "pkg_manager.orchestrator.abort",
                &format!("{}: abort requested", self.machine_id),
            );
        }
    }

    pub fn state(&self) -> OrchestratorPhase {
        *self.phase.borrow()
    }

    /// Wait until the machine reaches `done`.
    pub async fn wait_done(&mut self) {
        let _ = self.phase.wait_for(|phase| phase.is_done()).await;
    }

    pub async fn outcome(self) -> OrchestratorOutcome {
        let machine_id = self.machine_id.clone();
        // Dropping the sender lets an idle machine shut down on its own
        drop(self.commands);
        match self.task.await {
            Ok(outcome) => outcome,
            Err(join) => crashed(machine_id, join),
        }
    }
}

fn crashed(machine_id: String, join: JoinError) -> OrchestratorOutcome {
    OrchestratorOutcome {
        error: Some(MachineError::with_failure(
            &machine_id,
            MachineFailure::Other(Box::new(join)),
        )),
        machine_id,
        aborted: true,
        noop: false,
        lingering: None,
    }
}

/// Spawn an orchestrator for `envelope`.
pub fn spawn(
    envelope: PackageManagerEnvelope,
    executor: Arc<dyn Executor>,
    file_manager: Arc<dyn FileManager>,
    options: OrchestratorOptions,
) -> OrchestratorHandle {
    let machine_id = format!("orchestrator-{}-{:08x}", envelope.spec.label(), rand::random::<u32>());
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (phase_tx, phase_rx) = watch::channel(OrchestratorPhase::Idle);
    let abort = Arc::new(AbortController::new());

    let mut queue = VecDeque::new();
    if !options.workspaces.is_empty() {
        queue.push_back(Batch {
            workspaces: options.workspaces.clone(),
            scripts: options.scripts.clone(),
            reply: None,
        });
    }

    let machine = Machine {
        machine_id: machine_id.clone(),
        envelope,
        executor,
        file_manager,
        abort_signal: abort.signal().either(&options.signal),
        options,
        commands: commands_rx,
        commands_open: true,
        queue,
        phase: phase_tx,
        ctx: None,
        received: 0,
        aborted: false,
        error: MachineError::new(&machine_id),
        lingering: None,
    };

    OrchestratorHandle {
        machine_id,
        commands: commands_tx,
        abort,
        phase: phase_rx,
        task: tokio::spawn(machine.run()),
    }
}

enum IdleExit {
    Start(Batch),
    Halt,
    Abort,
    TimedOut(Duration),
}

enum WorkExit {
    Complete,
    Halted,
    Aborted,
}

struct Machine {
    machine_id: String,
    envelope: PackageManagerEnvelope,
    executor: Arc<dyn Executor>,
    file_manager: Arc<dyn FileManager>,
    /// Fires for the handle's abort and for the external signal.
    abort_signal: AbortSignal,
    options: OrchestratorOptions,
    commands: mpsc::UnboundedReceiver<Command>,
    commands_open: bool,
    queue: VecDeque<Batch>,
    phase: watch::Sender<OrchestratorPhase>,
    ctx: Option<ExecutionContext>,
    received: usize,
    aborted: bool,
    error: MachineError,
    lingering: Option<PathBuf>,
}

impl Machine {
    fn current(&self) -> OrchestratorPhase {
        *self.phase.borrow()
    }

    fn transition(&mut self, next: OrchestratorPhase) {
        let current = self.current();
        if !current.can_transition_to(next) {
            self.error.push(MachineFailure::IllegalTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        debug(
            "pkg_manager.orchestrator.transition",
            &format!("{}: {} -> {}", self.machine_id, current, next),
        );
        self.phase.send_replace(next);
    }

    fn abort_requested(&self) -> bool {
        self.abort_signal.is_aborted()
    }

    fn lifecycle_error(&self, stage: LifecycleStage, source: ContextError) -> LifecycleError {
        LifecycleError::new(stage, self.envelope.spec.label(), self.envelope.plugin_id(), source)
    }

    async fn run(mut self) -> OrchestratorOutcome {
        loop {
            let batch = match self.next_batch().await {
                IdleExit::Start(batch) => batch,
                IdleExit::Halt => break,
                IdleExit::Abort => {
                    self.aborted = true;
                    break;
                }
                IdleExit::TimedOut(after) => {
                    self.error.push(MachineFailure::IdleTimeout { after });
                    break;
                }
            };

            if batch.workspaces.is_empty() {
                if let Some(reply) = batch.reply {
                    let _ = reply.send(BatchReport::default());
                }
                continue;
            }
            self.received += batch.workspaces.len();

            let ctx = match self.ctx.take() {
                Some(ctx) => ctx.with_workspaces(batch.workspaces.clone()),
                None => match self.startup(&batch).await {
                    Some(ctx) => ctx,
                    None => break,
                },
            };
            self.ctx = Some(ctx.clone());

            // A halt may have queued up while starting
            if self.drain_commands() {
                break;
            }

            match self.work(ctx, batch).await {
                WorkExit::Complete => {}
                WorkExit::Halted => break,
                WorkExit::Aborted => {
                    self.aborted = true;
                    break;
                }
            }
        }

        // createContext failed: terminal without shutdown
        if !self.current().is_done() {
            self.shutdown().await;
        }
        self.finish()
    }

    /// Next batch to work on, or why the machine should stop.
    async fn next_batch(&mut self) -> IdleExit {
        if self.abort_requested() {
            return IdleExit::Abort;
        }
        if let Some(batch) = self.queue.pop_front() {
            return IdleExit::Start(batch);
        }

        // The timeout only guards an orchestrator that never got work
        let timeout = if self.received == 0 {
            self.options.idle_timeout
        } else {
            None
        };
        let sleep = async {
            match timeout {
                Some(after) => tokio::time::sleep(after).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.abort_signal.aborted() => IdleExit::Abort,
            cmd = self.commands.recv() => match cmd {
                Some(Command::Start(batch)) => IdleExit::Start(batch),
                Some(Command::Halt) => IdleExit::Halt,
                None => {
                    self.commands_open = false;
                    IdleExit::Halt
                }
            },
            _ = sleep => IdleExit::TimedOut(timeout.unwrap_or_default()),
        }
    }

    /// Pull pending commands without waiting. Returns true on halt.
    fn drain_commands(&mut self) -> bool {
        if !self.commands_open {
            return false;
        }
        loop {
            match self.commands.try_recv() {
                Ok(Command::Start(batch)) => self.queue.push_back(batch),
                Ok(Command::Halt) => return true,
                Err(mpsc::error::TryRecvError::Empty) => return false,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.commands_open = false;
                    return false;
                }
            }
        }
    }

    /// Create the context and run setup. `None` means stop.
    async fn startup(&mut self, batch: &Batch) -> Option<ExecutionContext> {
        self.transition(OrchestratorPhase::Startup(StartupStep::CreateContext));

        let created = context::create(
            Arc::clone(&self.envelope.spec),
            Arc::clone(&self.executor),
            Arc::clone(&self.file_manager),
            batch.workspaces.clone(),
            self.options.context,
            &self.abort_signal,
        )
        .await;

        let ctx = match created {
            Ok(ctx) => ctx,
            Err(ContextError::Aborted) => {
                self.aborted = true;
                self.transition(OrchestratorPhase::Shutdown(ShutdownStep::Gate));
                return None;
            }
            Err(err) => {
                self.error.push(self.lifecycle_error(LifecycleStage::Setup, err));
                self.aborted = true;
                self.transition(OrchestratorPhase::Done);
                return None;
            }
        };
        // From here on the directory must be released in shutdown
        self.ctx = Some(ctx.clone());

        if self.abort_requested() {
            self.aborted = true;
            return None;
        }

        self.transition(OrchestratorPhase::Startup(StartupStep::SetupLifecycle));
        let setup = tokio::select! {
            biased;
            _ = self.abort_signal.aborted() => {
                self.aborted = true;
                return None;
            }
            res = hooks::run_setup(&self.envelope, &ctx) => res,
        };
        if let Err(err) = setup {
            self.error.push(err);
            self.aborted = true;
            return None;
        }

        Some(ctx)
    }

    async fn work(&mut self, ctx: ExecutionContext, batch: Batch) -> WorkExit {
        self.transition(OrchestratorPhase::WORKING);

        let workers_abort = AbortController::new();
        let shared = Arc::new(WorkerShared {
            envelope: self.envelope.clone(),
            ctx,
            signal: workers_abort.signal(),
            events: self.options.events.clone(),
            scripts: batch.scripts,
        });

        let (tx, rx) = mpsc::channel(shared.ctx.workspaces().len().max(1));
        let mut packing = tokio::spawn(worker::pack_all(Arc::clone(&shared), tx));
        let mut installing = tokio::spawn(worker::install_all(Arc::clone(&shared), rx));
        let mut pack_report: Option<Result<BatchReport, JoinError>> = None;
        let mut install_report: Option<Result<BatchReport, JoinError>> = None;

        let exit = loop {
            if pack_report.is_some() && install_report.is_some() {
                break WorkExit::Complete;
            }

            tokio::select! {
                biased;
                _ = self.abort_signal.aborted() => break WorkExit::Aborted,
                res = &mut packing, if pack_report.is_none() => {
                    pack_report = Some(res);
                    self.transition(OrchestratorPhase::Working {
                        packing_done: true,
                        installing_done: install_report.is_some(),
                    });
                }
                res = &mut installing, if install_report.is_none() => {
                    install_report = Some(res);
                    self.transition(OrchestratorPhase::Working {
                        packing_done: pack_report.is_some(),
                        installing_done: true,
                    });
                }
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(Command::Start(next)) => self.queue.push_back(next),
                    Some(Command::Halt) => break WorkExit::Halted,
                    // Nobody can send more work; finish this batch first
                    None => self.commands_open = false,
                },
            }
        };

        if !matches!(exit, WorkExit::Complete) {
            // Stop both regions and wait for them before anything else
            workers_abort.abort();
            if pack_report.is_none() {
                pack_report = Some(packing.await);
            }
            if install_report.is_none() {
                install_report = Some(installing.await);
            }
        }

        let mut report = BatchReport::default();
        for joined in [pack_report, install_report].into_iter().flatten() {
            match joined {
                Ok(part) => report.merge(part),
                Err(join) => {
                    report.interrupted = true;
                    self.error.push(MachineFailure::Other(Box::new(join)));
                }
            }
        }
        if matches!(exit, WorkExit::Complete) {
            self.transition(OrchestratorPhase::Idle);
        } else {
            report.interrupted = true;
        }

        if let Some(events) = &self.options.events {
            let _ = events.send(OrchestratorEvent::BatchComplete {
                pm: self.envelope.spec.label().to_string(),
                report: report.clone(),
            });
        }
        if let Some(reply) = batch.reply {
            let _ = reply.send(report);
        }

        exit
    }

    async fn shutdown(&mut self) {
        if self.current() != OrchestratorPhase::Shutdown(ShutdownStep::Gate) {
            self.transition(OrchestratorPhase::Shutdown(ShutdownStep::Gate));
        }

        if let Some(ctx) = self.ctx.take() {
            self.transition(OrchestratorPhase::Shutdown(ShutdownStep::DestroyContext));
            match context::destroy(&ctx, Arc::clone(&self.file_manager)).await {
                Ok(lingering) => self.lingering = lingering,
                Err(err) => {
                    let err = self.lifecycle_error(LifecycleStage::Teardown, err);
                    self.error.push(err);
                }
            }

            self.transition(OrchestratorPhase::Shutdown(ShutdownStep::TeardownLifecycle));
            if let Err(err) = hooks::run_teardown(&self.envelope, &ctx).await {
                self.error.push(err);
            }
        }

        self.transition(OrchestratorPhase::Done);
    }

    fn finish(self) -> OrchestratorOutcome {
        // Anything still queued never runs; dropping it closes the tickets
        let Machine {
            machine_id,
            aborted,
            received,
            error,
            lingering,
            ..
        } = self;
        OrchestratorOutcome {
            machine_id,
            aborted,
            noop: received == 0,
            error: (!error.is_empty()).then_some(error),
            lingering,
        }
    }
}
