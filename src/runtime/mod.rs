//! Runtime adapters: a uniform contract over disposable execution targets.
//!
//! A [`RuntimeAdapter`] is shareable plan-level configuration (which worker
//! command, which controller). For every job it hands out a fresh
//! [`RuntimeInstance`] that launches exactly one target, drives one
//! execution through it, and is then stopped and thrown away.

pub mod outcome;
pub mod process;
pub mod session;
pub mod stop;
pub mod thread;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::abort::AbortSignal;

pub use self::outcome::{
    ConsoleCall, ConsoleKind, ExecutionError, ExecutionStatus, RunOutcome, RunTimings,
};
pub use self::stop::{StopLatch, StopOutcome, StopState};

/// Environment variable through which worker processes learn where to write
/// coverage.
pub const COVERAGE_FILE_ENV: &str = "JOBMATRIX_COVERAGE_FILE";

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The target never reached its ready state.
    #[error("failed to launch {runtime}: {reason}")]
    Launch { runtime: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("runtime crashed: {0}")]
    Crashed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn launch(runtime: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        RuntimeError::Launch {
            runtime: runtime.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<&RuntimeError> for ExecutionError {
    fn from(err: &RuntimeError) -> Self {
        let name = match err {
            RuntimeError::Launch { .. } => "LaunchError",
            RuntimeError::Protocol(_) => "ProtocolError",
            RuntimeError::Crashed(_) => "CrashError",
            RuntimeError::Io(_) => "IoError",
        };
        ExecutionError::new(name, err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeIdentity {
    pub name: String,
    pub version: String,
}

impl std::fmt::Display for RuntimeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Lifecycle notifications flowing from an instance to its execution.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Console(ConsoleCall),
    RuntimeStarted,
    RuntimeStopped,
}

/// Sending half of an execution's event stream. Sends never fail; events
/// emitted after the execution settled are dropped.
#[derive(Debug, Clone)]
pub struct RuntimeEvents {
    tx: mpsc::UnboundedSender<RuntimeEvent>,
}

impl RuntimeEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn console(&self, kind: ConsoleKind, text: impl Into<String>) {
        let _ = self.tx.send(RuntimeEvent::Console(ConsoleCall::new(kind, text)));
    }

    pub fn started(&self) {
        let _ = self.tx.send(RuntimeEvent::RuntimeStarted);
    }

    pub fn stopped(&self) {
        let _ = self.tx.send(RuntimeEvent::RuntimeStopped);
    }
}

/// Everything an instance needs to run one file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Composed abort signal (batch, caller and job timeout).
    pub signal: AbortSignal,
    pub file_url: String,
    pub root_directory: PathBuf,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub keep_running: bool,
    pub collect_console: bool,
    pub collect_performance: bool,
    pub measure_memory_usage: bool,
    /// Set iff coverage is collected; unique per job.
    pub coverage_file: Option<PathBuf>,
    pub events: RuntimeEvents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopRequest {
    /// How long a graceful stop may take before the target is forced down.
    pub grace: Duration,
}

impl Default for StopRequest {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(4000),
        }
    }
}

/// Plan-level description of an execution target.
pub trait RuntimeAdapter: Send + Sync {
    fn identity(&self) -> RuntimeIdentity;

    /// Create a fresh instance. Instances are never reused across jobs.
    fn instantiate(&self) -> Arc<dyn RuntimeInstance>;
}

/// One disposable execution target.
#[async_trait::async_trait]
pub trait RuntimeInstance: Send + Sync {
    /// Launch the target and execute `options.file_url` in it.
    async fn run(&self, options: RunOptions) -> Result<RunOutcome, RuntimeError>;

    /// Stop the target. Safe to call zero or more times, also concurrently;
    /// every call returns the first call's outcome.
    async fn stop(&self, request: StopRequest) -> StopOutcome;
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn epoch_ms() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1000.0
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "runtime panicked".to_string()
    }
}
