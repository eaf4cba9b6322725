//! Out-of-process runtime: one worker process per job.
//!
//! The worker is spawned with piped stdio and must print a `ready` protocol
//! line once it listens on stdin. The controller then writes one `action`
//! line and waits for `action-result`, racing it against the process exit
//! and the abort signal. Every other stdout line is forwarded as a `log`
//! console call, every stderr line as `error`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use super::{
    ConsoleKind, RunOptions, RunOutcome, RuntimeAdapter, RuntimeError, RuntimeEvents,
    RuntimeIdentity, RuntimeInstance, StopLatch, StopOutcome, StopRequest, COVERAGE_FILE_ENV,
};
use crate::abort::AbortSignal;
use crate::ipc::{self, Action, ActionParams, IpcMessage};
use crate::runtime::ExecutionError;
use crate::system;

/// Exit code a worker uses when its debugger port is already taken.
pub const DEBUG_PORT_UNAVAILABLE_EXIT_CODE: i32 = 12;

/// How long stdout may stay open after the worker exited.
const STDOUT_DRAIN: Duration = Duration::from_millis(500);

/// The command that starts one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Defaults to the run's root directory.
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Runtime adapter spawning a [`WorkerCommand`] per job.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    name: String,
    version: String,
    command: WorkerCommand,
}

impl ProcessRuntime {
    pub fn new(name: impl Into<String>, version: impl Into<String>, command: WorkerCommand) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            command,
        }
    }
}

impl RuntimeAdapter for ProcessRuntime {
    fn identity(&self) -> RuntimeIdentity {
        RuntimeIdentity {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    fn instantiate(&self) -> Arc<dyn RuntimeInstance> {
        Arc::new(ProcessInstance {
            runtime_name: self.name.clone(),
            command: self.command.clone(),
            worker: Mutex::new(None),
            latch: StopLatch::new(),
        })
    }
}

/// How the worker process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    /// Classify an exit that happened while an execution was pending.
    pub fn into_outcome(self) -> RunOutcome {
        match self.code {
            None => match self.signal {
                Some(signal) => RunOutcome::disconnected(format!(
                    "worker process disconnected (signal {signal})"
                )),
                None => RunOutcome::disconnected("worker process disconnected"),
            },
            Some(0)
            | Some(system::SIGINT_EXIT_CODE)
            | Some(system::SIGTERM_EXIT_CODE)
            | Some(system::SIGKILL_EXIT_CODE) => {
                RunOutcome::disconnected("worker process disconnected")
            }
            Some(DEBUG_PORT_UNAVAILABLE_EXIT_CODE) => RunOutcome::failed(ExecutionError::new(
                "DebugPortError",
                format!(
                    "worker process exited with code {DEBUG_PORT_UNAVAILABLE_EXIT_CODE} (debug port unavailable)"
                ),
            )),
            Some(code) => {
                RunOutcome::disconnected(format!("worker process exited with code {code}"))
            }
        }
    }
}

/// Control handles kept by the instance once the worker is spawned.
struct WorkerControl {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<WorkerExit>>,
}

struct ProcessInstance {
    runtime_name: String,
    command: WorkerCommand,
    worker: Mutex<Option<WorkerControl>>,
    latch: StopLatch,
}

impl ProcessInstance {
    fn spawn(&self, options: &RunOptions) -> Result<WorkerLink, RuntimeError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args)
            .envs(&self.command.env)
            .current_dir(self.command.cwd.as_ref().unwrap_or(&options.root_directory))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(coverage_file) = &options.coverage_file {
            cmd.env(COVERAGE_FILE_ENV, coverage_file);
        }

        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::launch(
                &self.runtime_name,
                format!("failed to spawn '{}': {}", self.command.program, e),
            )
        })?;
        let pid = child.id();
        info!(runtime = %self.runtime_name, ?pid, file = %options.file_url, "worker process spawned");

        let stdin = child.stdin.take();
        let (messages_tx, messages) = mpsc::unbounded_channel::<StdoutItem>();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stdout(stdout, messages_tx, options.events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stderr(stderr, options.events.clone()));
        }

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit) = watch::channel(None);
        let events = options.events.clone();
        let runtime_name = self.runtime_name.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = &mut kill_rx => {
                    if let Some(pid) = pid {
                        system::kill_group(pid);
                    }
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => WorkerExit::from_status(status),
                Err(e) => {
                    warn!(runtime = %runtime_name, error = %e, "failed to wait for worker process");
                    WorkerExit::default()
                }
            };
            debug!(runtime = %runtime_name, ?pid, code = exit.code, signal = exit.signal, "worker process exited");
            events.stopped();
            exit_tx.send_replace(Some(exit));
        });

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(WorkerControl {
                pid,
                kill: Some(kill_tx),
                exit: exit.clone(),
            });
        }

        Ok(WorkerLink {
            stdin,
            messages,
            exit,
            dropped_lines: 0,
            stdout_closed: false,
            exited: None,
            drain_deadline: None,
        })
    }

    async fn terminate(&self, grace: Duration) -> StopOutcome {
        let (pid, kill, mut exit) = match self.worker.lock() {
            Ok(mut worker) => match worker.as_mut() {
                Some(control) => (control.pid, control.kill.take(), control.exit.clone()),
                None => return StopOutcome::AlreadyExited,
            },
            Err(_) => return StopOutcome::Failed("worker state poisoned".to_string()),
        };
        if exit.borrow().is_some() {
            return StopOutcome::AlreadyExited;
        }

        let signalled = pid.map(system::send_terminate).unwrap_or(false);
        if signalled && tokio::time::timeout(grace, wait_for_exit(&mut exit)).await.is_ok() {
            debug!(runtime = %self.runtime_name, ?pid, "worker stopped gracefully");
            return StopOutcome::Graceful;
        }

        warn!(runtime = %self.runtime_name, ?pid, "worker did not stop within grace period, killing");
        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        match tokio::time::timeout(grace, wait_for_exit(&mut exit)).await {
            Ok(_) => StopOutcome::Forced,
            Err(_) => StopOutcome::Failed(format!("worker process {pid:?} survived SIGKILL")),
        }
    }
}

#[async_trait::async_trait]
impl RuntimeInstance for ProcessInstance {
    async fn run(&self, options: RunOptions) -> Result<RunOutcome, RuntimeError> {
        let mut link = self.spawn(&options)?;
        options.events.started();

        // Never send the action before the worker is listening.
        loop {
            match link.next(&options.signal).await {
                WorkerEvent::Message(IpcMessage::Ready) => break,
                WorkerEvent::Message(other) => {
                    debug!(runtime = %self.runtime_name, ?other, "ignoring message before ready");
                }
                WorkerEvent::Exited(exit) => return Ok(exit.into_outcome()),
                WorkerEvent::Aborted => return Ok(RunOutcome::aborted()),
            }
        }

        let action = IpcMessage::Action(Action::execute(ActionParams {
            file_url: options.file_url.clone(),
            collect_performance: options.collect_performance,
            exit_after_action: !options.keep_running,
            measure_memory_usage: options.measure_memory_usage,
        }));
        let mut line = ipc::encode_line(&action).map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        line.push('\n');
        if let Err(e) = link.send_line(&line).await {
            // The exit (if any) is picked up below.
            debug!(runtime = %self.runtime_name, error = %e, "failed to write action to worker");
        }

        loop {
            match link.next(&options.signal).await {
                WorkerEvent::Message(IpcMessage::ActionResult(result)) => {
                    return Ok(result.into_outcome());
                }
                WorkerEvent::Message(other) => {
                    debug!(runtime = %self.runtime_name, ?other, "ignoring unexpected worker message");
                }
                // The result was most likely the line that had to be dropped.
                WorkerEvent::Exited(_) if link.dropped_lines > 0 => {
                    return Ok(RunOutcome::failed(oversized_result_error()));
                }
                WorkerEvent::Exited(exit) => return Ok(exit.into_outcome()),
                WorkerEvent::Aborted => return Ok(RunOutcome::aborted()),
            }
        }
    }

    async fn stop(&self, request: StopRequest) -> StopOutcome {
        self.latch
            .stop_with(|| self.terminate(request.grace))
            .await
    }
}

fn oversized_result_error() -> ExecutionError {
    ExecutionError::new(
        "ProtocolError",
        format!("action-result exceeded {} bytes", ipc::MAX_LINE_LENGTH),
    )
}

/// What the stdout reader hands to the controller.
enum StdoutItem {
    Message(IpcMessage),
    /// A line longer than [`ipc::MAX_LINE_LENGTH`] was discarded.
    Oversized,
}

enum WorkerEvent {
    Message(IpcMessage),
    Exited(WorkerExit),
    Aborted,
}

/// Controller end of one worker's stdio.
struct WorkerLink {
    stdin: Option<ChildStdin>,
    messages: mpsc::UnboundedReceiver<StdoutItem>,
    exit: watch::Receiver<Option<WorkerExit>>,
    /// Stdout lines discarded for exceeding the length limit.
    dropped_lines: usize,
    stdout_closed: bool,
    exited: Option<WorkerExit>,
    drain_deadline: Option<Instant>,
}

impl WorkerLink {
    async fn send_line(&mut self, line: &str) -> std::io::Result<()> {
        match self.stdin.as_mut() {
            Some(stdin) => {
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "worker stdin is not available",
            )),
        }
    }

    /// Next protocol message, exit or abort.
    ///
    /// After the process exits, messages still buffered in its stdout are
    /// delivered first (a worker usually writes its result and exits).
    async fn next(&mut self, signal: &AbortSignal) -> WorkerEvent {
        loop {
            if self.stdout_closed {
                if let Some(exit) = self.exited.clone() {
                    return WorkerEvent::Exited(exit);
                }
            }
            let drain_deadline = self.drain_deadline;
            tokio::select! {
                biased;
                _ = signal.aborted() => return WorkerEvent::Aborted,
                item = self.messages.recv(), if !self.stdout_closed => match item {
                    Some(StdoutItem::Message(message)) => return WorkerEvent::Message(message),
                    Some(StdoutItem::Oversized) => self.dropped_lines += 1,
                    None => self.stdout_closed = true,
                },
                exit = wait_for_exit(&mut self.exit), if self.exited.is_none() => {
                    self.exited = Some(exit);
                    self.drain_deadline = Some(Instant::now() + STDOUT_DRAIN);
                },
                _ = tokio::time::sleep_until(drain_deadline.unwrap_or_else(Instant::now)), if drain_deadline.is_some() => {
                    self.stdout_closed = true;
                }
            }
        }
    }
}

async fn wait_for_exit(exit: &mut watch::Receiver<Option<WorkerExit>>) -> WorkerExit {
    match exit.wait_for(Option::is_some).await {
        Ok(value) => value.clone().unwrap_or_default(),
        Err(_) => WorkerExit::default(),
    }
}

/// Next line of a worker pipe.
///
/// `FramedRead` yields `None` once after a decoder error and then resumes,
/// so an over-long line must not end the loop.
async fn next_line<R: AsyncRead + Unpin>(
    lines: &mut FramedRead<R, LinesCodec>,
    resume: &mut bool,
) -> Option<Result<String, LinesCodecError>> {
    loop {
        match lines.next().await {
            Some(line) => {
                *resume = matches!(line, Err(LinesCodecError::MaxLineLengthExceeded));
                return Some(line);
            }
            None if std::mem::take(resume) => continue,
            None => return None,
        }
    }
}

async fn read_stdout(
    stdout: impl AsyncRead + Unpin,
    messages: mpsc::UnboundedSender<StdoutItem>,
    events: RuntimeEvents,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(ipc::MAX_LINE_LENGTH));
    let mut resume = false;
    while let Some(line) = next_line(&mut lines, &mut resume).await {
        let line = match line {
            Ok(line) => line,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!(limit = ipc::MAX_LINE_LENGTH, "discarding over-long line from worker stdout");
                let _ = messages.send(StdoutItem::Oversized);
                continue;
            }
            Err(e) => {
                warn!(error = %e, "failed to read worker stdout");
                continue;
            }
        };
        match ipc::decode_line(&line) {
            Ok(Some(message)) => {
                let _ = messages.send(StdoutItem::Message(message));
            }
            Ok(None) => events.console(ConsoleKind::Log, format!("{line}\n")),
            Err(e) => {
                warn!(error = %e, "dropping malformed protocol line from worker");
            }
        }
    }
}

async fn read_stderr(stderr: impl AsyncRead + Unpin, events: RuntimeEvents) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new_with_max_length(ipc::MAX_LINE_LENGTH));
    let mut resume = false;
    while let Some(line) = next_line(&mut lines, &mut resume).await {
        match line {
            Ok(line) => events.console(ConsoleKind::Error, format!("{line}\n")),
            Err(e) => warn!(error = %e, "failed to read worker stderr"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ExecutionStatus;

    #[test]
    fn test_clean_exit_while_pending_is_disconnected() {
        let outcome = WorkerExit { code: Some(0), signal: None }.into_outcome();
        assert_eq!(outcome.status, ExecutionStatus::Disconnected);
    }

    #[test]
    fn test_signal_exit_is_disconnected() {
        let outcome = WorkerExit { code: None, signal: Some(9) }.into_outcome();
        assert_eq!(outcome.status, ExecutionStatus::Disconnected);
        let outcome = WorkerExit { code: Some(143), signal: None }.into_outcome();
        assert_eq!(outcome.status, ExecutionStatus::Disconnected);
        assert_eq!(outcome.errors[0].message, "worker process disconnected");
    }

    #[test]
    fn test_debug_port_exit_is_failed() {
        let outcome = WorkerExit { code: Some(12), signal: None }.into_outcome();
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.errors[0].message.contains("debug port unavailable"));
    }

    #[test]
    fn test_other_exit_code_is_embedded() {
        let outcome = WorkerExit { code: Some(3), signal: None }.into_outcome();
        assert_eq!(outcome.status, ExecutionStatus::Disconnected);
        assert_eq!(outcome.errors[0].message, "worker process exited with code 3");
    }

    #[tokio::test]
    async fn test_over_long_stdout_line_is_reported_and_skipped() {
        let mut input = b"before\n".to_vec();
        input.extend(std::iter::repeat(b'x').take(ipc::MAX_LINE_LENGTH + 16));
        input.extend_from_slice(b"\n{\"jobmatrix\":1,\"type\":\"ready\"}\nafter\n");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (events, mut event_rx) = RuntimeEvents::channel();
        read_stdout(input.as_slice(), tx, events).await;

        assert!(matches!(rx.try_recv(), Ok(StdoutItem::Oversized)));
        assert!(matches!(rx.try_recv(), Ok(StdoutItem::Message(IpcMessage::Ready))));
        assert!(rx.try_recv().is_err());

        let mut texts = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            if let crate::runtime::RuntimeEvent::Console(call) = event {
                texts.push(call.text);
            }
        }
        assert_eq!(texts, vec!["before\n".to_string(), "after\n".to_string()]);
    }
}
