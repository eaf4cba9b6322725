//! Remote automation session runtime.
//!
//! Each job opens its own TCP connection to a long-lived automation
//! controller: one connection is one session, never shared. The controller
//! loads the file, streams console output and page errors while it runs,
//! and finishes with an `Outcome` frame.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use super::{
    ConsoleKind, RunOptions, RunOutcome, RuntimeAdapter, RuntimeError, RuntimeEvents,
    RuntimeIdentity, RuntimeInstance, StopLatch, StopOutcome, StopRequest,
};
use crate::session_proto::rpc::{self, SessionMessage, SESSION_PROTOCOL_VERSION};
use crate::session_proto::wire::SessionCodec;

type SessionFramed = Framed<TcpStream, SessionCodec>;

/// Runtime adapter attaching to an automation controller at `controller`.
#[derive(Debug, Clone)]
pub struct SessionRuntime {
    name: String,
    version: String,
    controller: String,
    connect_timeout: Duration,
}

impl SessionRuntime {
    pub fn new(name: impl Into<String>, version: impl Into<String>, controller: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            controller: controller.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl RuntimeAdapter for SessionRuntime {
    fn identity(&self) -> RuntimeIdentity {
        RuntimeIdentity {
            name: self.name.clone(),
            version: self.version.clone(),
        }
    }

    fn instantiate(&self) -> Arc<dyn RuntimeInstance> {
        Arc::new(SessionInstance {
            runtime: self.clone(),
            sink: tokio::sync::Mutex::new(None),
            events: Mutex::new(None),
            latch: StopLatch::new(),
        })
    }
}

struct SessionInstance {
    runtime: SessionRuntime,
    sink: tokio::sync::Mutex<Option<SplitSink<SessionFramed, SessionMessage>>>,
    events: Mutex<Option<RuntimeEvents>>,
    latch: StopLatch,
}

impl SessionInstance {
    /// TCP connect plus Hello/Welcome exchange.
    async fn attach(&self) -> anyhow::Result<(SessionFramed, rpc::Welcome)> {
        let stream = tokio::time::timeout(
            self.runtime.connect_timeout,
            TcpStream::connect(&self.runtime.controller),
        )
        .await
        .map_err(|_| anyhow!("timed out connecting to {}", self.runtime.controller))??;
        let mut framed = Framed::new(stream, SessionCodec::new());

        framed
            .send(SessionMessage::Hello(rpc::Hello {
                version: SESSION_PROTOCOL_VERSION.to_string(),
                client: format!("jobmatrix/{}", env!("CARGO_PKG_VERSION")),
            }))
            .await?;

        match framed.next().await {
            Some(Ok(SessionMessage::Welcome(welcome))) => Ok((framed, welcome)),
            Some(Ok(SessionMessage::Error(e))) => {
                Err(anyhow!("controller error {}: {}", e.code, e.message))
            }
            Some(Ok(other)) => Err(anyhow!("expected Welcome, got {:?}", other)),
            Some(Err(e)) => Err(e.context("failed to decode Welcome frame")),
            None => Err(anyhow!("connection closed before Welcome")),
        }
    }

    async fn await_outcome(
        &self,
        stream: &mut SplitStream<SessionFramed>,
        options: &RunOptions,
    ) -> Result<RunOutcome, RuntimeError> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = options.signal.aborted() => return Ok(RunOutcome::aborted()),
                frame = stream.next() => frame,
            };
            match frame {
                Some(Ok(SessionMessage::Console(call))) => {
                    options.events.console(call.kind, call.text);
                }
                Some(Ok(SessionMessage::PageError(error))) => {
                    options.events.console(ConsoleKind::Error, format!("{error}\n"));
                }
                Some(Ok(SessionMessage::Outcome(outcome))) => return Ok(outcome.into()),
                Some(Ok(SessionMessage::Error(e))) => {
                    return Err(RuntimeError::Protocol(format!(
                        "controller error {}: {}",
                        e.code, e.message
                    )));
                }
                Some(Ok(other)) => {
                    debug!(controller = %self.runtime.controller, ?other, "ignoring session message");
                }
                Some(Err(e)) => {
                    warn!(controller = %self.runtime.controller, error = %e, "session stream failed");
                    return Ok(RunOutcome::disconnected(format!(
                        "automation session disconnected: {e}"
                    )));
                }
                None => return Ok(RunOutcome::disconnected("automation session disconnected")),
            }
        }
    }

    async fn close(&self, grace: Duration) -> StopOutcome {
        let Some(mut sink) = self.sink.lock().await.take() else {
            return StopOutcome::AlreadyExited;
        };
        let outcome = match tokio::time::timeout(grace, async {
            sink.send(SessionMessage::Close).await?;
            sink.close().await
        })
        .await
        {
            Ok(Ok(())) => StopOutcome::Graceful,
            Ok(Err(e)) => {
                debug!(controller = %self.runtime.controller, error = %e, "session already closed");
                StopOutcome::AlreadyExited
            }
            Err(_) => {
                warn!(controller = %self.runtime.controller, "session did not close within grace period, dropping connection");
                StopOutcome::Forced
            }
        };
        let events = self.events.lock().ok().and_then(|mut events| events.take());
        if let Some(events) = events {
            events.stopped();
        }
        outcome
    }
}

#[async_trait::async_trait]
impl RuntimeInstance for SessionInstance {
    async fn run(&self, options: RunOptions) -> Result<RunOutcome, RuntimeError> {
        let (framed, welcome) = self
            .attach()
            .await
            .map_err(|e| RuntimeError::launch(&self.runtime.name, e))?;
        info!(
            controller = %self.runtime.controller,
            controller_name = %welcome.controller,
            file = %options.file_url,
            "automation session attached"
        );

        let (mut sink, mut stream) = framed.split();
        let open = SessionMessage::Open(rpc::OpenRequest {
            file_url: options.file_url.clone(),
            collect_console: options.collect_console,
            collect_performance: options.collect_performance,
            measure_memory_usage: options.measure_memory_usage,
            coverage_file: options
                .coverage_file
                .as_ref()
                .map(|path| path.display().to_string()),
            params: options.params.clone(),
        });
        sink.send(open)
            .await
            .map_err(|e| RuntimeError::launch(&self.runtime.name, e))?;

        match stream.next().await {
            Some(Ok(SessionMessage::Opened(opened))) => {
                debug!(session_id = %opened.session_id, "automation session opened");
            }
            Some(Ok(SessionMessage::Error(e))) => {
                return Err(RuntimeError::launch(
                    &self.runtime.name,
                    format!("controller refused session: {} ({})", e.message, e.code),
                ));
            }
            Some(Ok(other)) => {
                return Err(RuntimeError::Protocol(format!("expected Opened, got {other:?}")));
            }
            Some(Err(e)) => return Err(RuntimeError::launch(&self.runtime.name, e)),
            None => {
                return Err(RuntimeError::launch(
                    &self.runtime.name,
                    "connection closed before Opened",
                ))
            }
        }

        *self.sink.lock().await = Some(sink);
        if let Ok(mut events) = self.events.lock() {
            *events = Some(options.events.clone());
        }
        options.events.started();

        self.await_outcome(&mut stream, &options).await
    }

    async fn stop(&self, request: StopRequest) -> StopOutcome {
        self.latch.stop_with(|| self.close(request.grace)).await
    }
}
