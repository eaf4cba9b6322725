//! Readiness gate: make sure a server answers on an origin before jobs that
//! need it start, and tear it down afterward.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::abort::{AbortOperation, AbortSignal};
use crate::execution::DEFAULT_GRACE_PERIOD;
use crate::runtime::StopOutcome;
use crate::system;

/// Delay between two liveness probes.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ReadinessError {
    /// The server was not reachable in time, whatever the reason.
    #[error("\"{command}\" command did not start a server in less than {allocated_ms}ms")]
    NotStarted { command: String, allocated_ms: u128 },

    #[error("invalid server origin '{origin}': {reason}")]
    InvalidOrigin { origin: String, reason: String },

    #[error("failed to build liveness client: {0}")]
    Client(#[from] reqwest::Error),
}

/// A server started inside this process.
#[async_trait::async_trait]
pub trait ServerStarter: Send + Sync {
    /// Shown in logs and in [`ReadinessError::NotStarted`].
    fn describe(&self) -> String;

    /// Serve until `shutdown` fires.
    async fn serve(&self, shutdown: AbortSignal) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub enum ServerSource {
    /// A shell command, run through `sh -c` (`cmd /C` on Windows).
    Command { command: String, cwd: Option<PathBuf> },
    InProcess(Arc<dyn ServerStarter>),
}

impl ServerSource {
    pub fn command(command: impl Into<String>) -> Self {
        ServerSource::Command {
            command: command.into(),
            cwd: None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            ServerSource::Command { command, .. } => command.clone(),
            ServerSource::InProcess(starter) => starter.describe(),
        }
    }
}

impl std::fmt::Debug for ServerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerSource::Command { command, cwd } => f
                .debug_struct("Command")
                .field("command", command)
                .field("cwd", cwd)
                .finish(),
            ServerSource::InProcess(starter) => {
                f.debug_tuple("InProcess").field(&starter.describe()).finish()
            }
        }
    }
}

/// HTTP liveness probe: any response, whatever its status, means alive.
#[derive(Debug, Clone)]
pub struct LivenessProbe {
    client: Client,
    origin: Url,
}

impl LivenessProbe {
    pub fn new(origin: &str) -> Result<Self, ReadinessError> {
        let origin = Url::parse(origin).map_err(|e| ReadinessError::InvalidOrigin {
            origin: origin.to_string(),
            reason: e.to_string(),
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(1))
            .no_proxy()
            .build()?;
        Ok(Self { client, origin })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub async fn is_reachable(&self) -> bool {
        match self.client.get(self.origin.clone()).send().await {
            Ok(response) => {
                debug!(origin = %self.origin, status = %response.status(), "origin reachable");
                true
            }
            Err(_) => false,
        }
    }
}

enum Running {
    /// Someone else's server was already answering.
    External,
    Child(Child),
    Task {
        task: JoinHandle<()>,
        shutdown: AbortOperation,
    },
}

/// A reachable server. Dropping it without [`ServerHandle::stop`] kills a
/// spawned command but leaves in-process servers running.
pub struct ServerHandle {
    origin: Url,
    label: String,
    running: Running,
}

impl ServerHandle {
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// False when the origin was already reachable and nothing was started.
    pub fn started(&self) -> bool {
        !matches!(self.running, Running::External)
    }

    pub async fn stop(self) -> StopOutcome {
        self.stop_within(DEFAULT_GRACE_PERIOD).await
    }

    /// Stop the server, forcing it down after `grace`.
    pub async fn stop_within(self, grace: Duration) -> StopOutcome {
        let outcome = stop_running(self.running, grace).await;
        info!(server = %self.label, origin = %self.origin, ?outcome, "server stopped");
        outcome
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("origin", &self.origin.as_str())
            .field("label", &self.label)
            .field("started", &self.started())
            .finish()
    }
}

fn start(source: &ServerSource) -> std::io::Result<Running> {
    match source {
        ServerSource::Command { command, cwd } => {
            let mut cmd = shell_command(command);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);
            #[cfg(unix)]
            cmd.process_group(0);
            if let Some(cwd) = cwd {
                cmd.current_dir(cwd);
            }
            let child = cmd.spawn()?;
            debug!(command = %command, pid = ?child.id(), "server command spawned");
            Ok(Running::Child(child))
        }
        ServerSource::InProcess(starter) => {
            let shutdown = AbortOperation::root();
            let signal = shutdown.signal();
            let starter = starter.clone();
            let task = tokio::spawn(async move {
                if let Err(e) = starter.serve(signal).await {
                    warn!(server = %starter.describe(), error = %e, "in-process server failed");
                }
            });
            Ok(Running::Task { task, shutdown })
        }
    }
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

async fn stop_running(running: Running, grace: Duration) -> StopOutcome {
    match running {
        Running::External => StopOutcome::AlreadyExited,
        Running::Child(mut child) => {
            if let Ok(Some(_)) = child.try_wait() {
                return StopOutcome::AlreadyExited;
            }
            if system::terminate_child(&mut child, grace).await {
                StopOutcome::Graceful
            } else {
                StopOutcome::Forced
            }
        }
        Running::Task { mut task, shutdown } => {
            shutdown.abort();
            match tokio::time::timeout(grace, &mut task).await {
                Ok(_) => StopOutcome::Graceful,
                Err(_) => {
                    task.abort();
                    let _ = task.await;
                    StopOutcome::Forced
                }
            }
        }
    }
}

/// Resolve once `origin` answers, starting `source` if it does not yet.
///
/// Fails with [`ReadinessError::NotStarted`] when the origin is still not
/// reachable after `allocated`. An early exit of the command is not treated
/// differently: polling goes on until the deadline.
pub async fn ensure_server_reachable(
    source: ServerSource,
    origin: &str,
    allocated: Duration,
) -> Result<ServerHandle, ReadinessError> {
    let probe = LivenessProbe::new(origin)?;
    let label = source.label();

    if probe.is_reachable().await {
        info!(origin = %probe.origin(), "server already reachable, nothing started");
        return Ok(ServerHandle {
            origin: probe.origin().clone(),
            label,
            running: Running::External,
        });
    }

    let not_started = || ReadinessError::NotStarted {
        command: label.clone(),
        allocated_ms: allocated.as_millis(),
    };
    let running = match start(&source) {
        Ok(running) => running,
        Err(e) => {
            warn!(server = %label, error = %e, "failed to start server");
            return Err(not_started());
        }
    };

    let deadline = Instant::now() + allocated;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let reachable = tokio::time::timeout(remaining, probe.is_reachable())
            .await
            .unwrap_or(false);
        if reachable {
            info!(server = %label, origin = %probe.origin(), "server reachable");
            return Ok(ServerHandle {
                origin: probe.origin().clone(),
                label,
                running,
            });
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep_until((now + PROBE_INTERVAL).min(deadline)).await;
    }

    warn!(server = %label, allocated_ms = allocated.as_millis() as u64, "server not reachable in time");
    stop_running(running, Duration::from_millis(500)).await;
    Err(not_started())
}
