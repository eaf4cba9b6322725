//! In-thread runtime: one dedicated OS thread per job.
//!
//! The worker thread runs a [`WorkerEntry`] and talks to the controller with
//! the same [`IpcMessage`] values the process runtime writes to stdio, just
//! passed over channels instead of serialized.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sysinfo::{ProcessRefreshKind, RefreshKind, System};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    epoch_ms, panic_message, ConsoleKind, ExecutionError, RunOptions, RunOutcome, RunTimings,
    RuntimeAdapter, RuntimeError, RuntimeEvents, RuntimeIdentity, RuntimeInstance, StopLatch,
    StopOutcome, StopRequest,
};
use crate::ipc::{Action, ActionParams, ActionResult, ActionValue, IpcMessage};

/// What the worker thread is asked to execute.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub file_url: String,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub collect_performance: bool,
}

/// Console output handle given to a [`WorkerEntry`].
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    events: RuntimeEvents,
}

impl ConsoleSink {
    pub fn log(&self, text: impl AsRef<str>) {
        self.call(ConsoleKind::Log, text);
    }

    pub fn error(&self, text: impl AsRef<str>) {
        self.call(ConsoleKind::Error, text);
    }

    pub fn call(&self, kind: ConsoleKind, text: impl AsRef<str>) {
        self.events.console(kind, format!("{}\n", text.as_ref()));
    }
}

/// Executes one file inside the worker thread and returns its namespace.
pub type WorkerEntry = Arc<
    dyn Fn(&WorkerRequest, &ConsoleSink) -> Result<serde_json::Value, ExecutionError>
        + Send
        + Sync,
>;

/// Runtime adapter running a [`WorkerEntry`] on a fresh thread per job.
#[derive(Clone)]
pub struct ThreadRuntime {
    name: String,
    version: String,
    entry: WorkerEntry,
}

impl ThreadRuntime {
    pub fn new(name: impl Into<String>, version: impl Into<String>, entry: WorkerEntry) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            entry,
        }
    }
}

impl std::fmt::Debug for ThreadRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadRuntime")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl RuntimeAdapter for ThreadRuntime {
    fn identity(&self) -> RuntimeIdentity {
        RuntimeIdentity {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    fn instantiate(&self) -> Arc<dyn RuntimeInstance> {
        Arc::new(ThreadInstance {
            runtime_name: self.name.clone(),
            entry: self.entry.clone(),
            control: Mutex::new(None),
            latch: StopLatch::new(),
        })
    }
}

struct ThreadControl {
    inbox: std_mpsc::Sender<IpcMessage>,
    finished: watch::Receiver<bool>,
}

struct ThreadInstance {
    runtime_name: String,
    entry: WorkerEntry,
    control: Mutex<Option<ThreadControl>>,
    latch: StopLatch,
}

impl ThreadInstance {
    async fn terminate(&self, grace: Duration) -> StopOutcome {
        let (inbox, mut finished) = match self.control.lock() {
            Ok(control) => match control.as_ref() {
                Some(control) => (control.inbox.clone(), control.finished.clone()),
                None => return StopOutcome::AlreadyExited,
            },
            Err(_) => return StopOutcome::Failed("worker state poisoned".to_string()),
        };
        if *finished.borrow() {
            return StopOutcome::AlreadyExited;
        }

        let _ = inbox.send(IpcMessage::Terminate);
        let stopped = tokio::time::timeout(grace, finished.wait_for(|done| *done))
            .await
            .is_ok();
        if stopped {
            return StopOutcome::Graceful;
        }
        // Threads cannot be killed; the worker is left to finish alone.
        warn!(runtime = %self.runtime_name, "worker thread did not stop within grace period, detaching");
        StopOutcome::Forced
    }
}

#[async_trait::async_trait]
impl RuntimeInstance for ThreadInstance {
    async fn run(&self, options: RunOptions) -> Result<RunOutcome, RuntimeError> {
        let (inbox_tx, inbox_rx) = std_mpsc::channel::<IpcMessage>();
        let (outbox_tx, mut outbox) = mpsc::unbounded_channel::<IpcMessage>();
        let (finished_tx, finished) = watch::channel(false);

        let request = WorkerRequest {
            file_url: options.file_url.clone(),
            params: options.params.clone(),
            collect_performance: options.collect_performance,
        };
        let entry = self.entry.clone();
        let events = options.events.clone();
        std::thread::Builder::new()
            .name(format!("jobmatrix-{}", self.runtime_name))
            .spawn(move || {
                worker_main(entry, request, inbox_rx, outbox_tx, events.clone());
                events.stopped();
                finished_tx.send_replace(true);
            })
            .map_err(|e| RuntimeError::launch(&self.runtime_name, e))?;

        if let Ok(mut control) = self.control.lock() {
            *control = Some(ThreadControl {
                inbox: inbox_tx.clone(),
                finished,
            });
        }
        info!(runtime = %self.runtime_name, file = %options.file_url, "worker thread spawned");
        options.events.started();

        let mut ready = false;
        loop {
            let message = tokio::select! {
                biased;
                _ = options.signal.aborted() => return Ok(RunOutcome::aborted()),
                message = outbox.recv() => message,
            };
            match message {
                Some(IpcMessage::Ready) if !ready => {
                    ready = true;
                    let action = IpcMessage::Action(Action::execute(ActionParams {
                        file_url: options.file_url.clone(),
                        collect_performance: options.collect_performance,
                        exit_after_action: !options.keep_running,
                        measure_memory_usage: options.measure_memory_usage,
                    }));
                    if inbox_tx.send(action).is_err() {
                        return Ok(RunOutcome::disconnected("worker thread exited before the action was sent"));
                    }
                }
                Some(IpcMessage::ActionResult(result)) if ready => return Ok(result.into_outcome()),
                Some(other) => {
                    debug!(runtime = %self.runtime_name, ?other, "ignoring unexpected worker message");
                }
                None => {
                    return Ok(RunOutcome::disconnected(
                        "worker thread exited before reporting a result",
                    ))
                }
            }
        }
    }

    async fn stop(&self, request: StopRequest) -> StopOutcome {
        self.latch
            .stop_with(|| self.terminate(request.grace))
            .await
    }
}

fn worker_main(
    entry: WorkerEntry,
    request: WorkerRequest,
    inbox: std_mpsc::Receiver<IpcMessage>,
    outbox: mpsc::UnboundedSender<IpcMessage>,
    events: RuntimeEvents,
) {
    if outbox.send(IpcMessage::Ready).is_err() {
        return;
    }
    let console = ConsoleSink { events };

    while let Ok(message) = inbox.recv() {
        match message {
            IpcMessage::Action(action) => {
                let result = execute_action(&entry, &request, &action, &console);
                if outbox.send(IpcMessage::ActionResult(result)).is_err() {
                    return;
                }
                if action.action_params.exit_after_action {
                    return;
                }
            }
            IpcMessage::Terminate => return,
            IpcMessage::Ready | IpcMessage::ActionResult(_) => {}
        }
    }
}

fn execute_action(
    entry: &WorkerEntry,
    request: &WorkerRequest,
    action: &Action,
    console: &ConsoleSink,
) -> ActionResult {
    let request = WorkerRequest {
        file_url: action.action_params.file_url.clone(),
        collect_performance: action.action_params.collect_performance,
        ..request.clone()
    };
    let execution_start = epoch_ms();
    let outcome = catch_unwind(AssertUnwindSafe(|| entry(&request, console)));
    let execution_end = epoch_ms();
    let memory_usage = action
        .action_params
        .measure_memory_usage
        .then(resident_memory)
        .flatten();

    match outcome {
        Ok(Ok(namespace)) => ActionResult::completed(ActionValue {
            namespace,
            timings: Some(RunTimings {
                execution_start: Some(execution_start),
                execution_end: Some(execution_end),
            }),
            memory_usage,
            performance: None,
        }),
        Ok(Err(error)) => ActionResult::failed(error),
        Err(panic) => ActionResult::failed(ExecutionError::new("PanicError", panic_message(panic.as_ref()))),
    }
}

/// Resident memory of this process, in bytes. Worker threads share it.
fn resident_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let system = System::new_with_specifics(
        RefreshKind::new().with_processes(ProcessRefreshKind::new().with_memory()),
    );
    system.process(pid).map(|process| process.memory())
}
