//! Readiness gate scenarios: command servers that never come up, and an
//! in-process server that serves a job and is torn down afterward.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use jobmatrix::abort::AbortSignal;
use jobmatrix::plan::{run_plan, JobEntry, NoopObserver, PlanOptions, TestPlan};
use jobmatrix::readiness::{
    ensure_server_reachable, LivenessProbe, ReadinessError, ServerSource, ServerStarter,
};
use jobmatrix::runtime::{
    ExecutionStatus, RunOptions, RunOutcome, RuntimeAdapter, RuntimeError, RuntimeIdentity,
    RuntimeInstance, StopOutcome, StopRequest,
};
use serde_json::json;

fn unused_origin() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_never_reachable_rejects_with_exact_message() {
    let started = Instant::now();
    let err = ensure_server_reachable(
        ServerSource::command("sleep 5"),
        &unused_origin(),
        Duration::from_millis(500),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ReadinessError::NotStarted { .. }));
    assert_eq!(
        err.to_string(),
        "\"sleep 5\" command did not start a server in less than 500ms"
    );
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_exiting_early_is_the_same_rejection() {
    let err = ensure_server_reachable(
        ServerSource::command("exit 1"),
        &unused_origin(),
        Duration::from_millis(500),
    )
    .await
    .unwrap_err();

    assert_eq!(
        err.to_string(),
        "\"exit 1\" command did not start a server in less than 500ms"
    );
}

/// Serves `/a.test.mjs` with a JSON namespace until shut down.
struct StaticServer {
    listener: Mutex<Option<std::net::TcpListener>>,
}

#[async_trait::async_trait]
impl ServerStarter for StaticServer {
    fn describe(&self) -> String {
        "static test server".to_string()
    }

    async fn serve(&self, shutdown: AbortSignal) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow::anyhow!("server already started"))?;
        listener.set_nonblocking(true)?;
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let app = axum::Router::new().route(
            "/a.test.mjs",
            axum::routing::get(|| async { axum::Json(json!({"default": "ok"})) }),
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.aborted().await })
            .await?;
        Ok(())
    }
}

/// Runtime that "executes" a file by fetching it and exporting the JSON body.
struct FetchRuntime;

struct FetchInstance;

impl RuntimeAdapter for FetchRuntime {
    fn identity(&self) -> RuntimeIdentity {
        RuntimeIdentity {
            name: "fetch".to_string(),
            version: "1".to_string(),
        }
    }

    fn instantiate(&self) -> Arc<dyn RuntimeInstance> {
        Arc::new(FetchInstance)
    }
}

#[async_trait::async_trait]
impl RuntimeInstance for FetchInstance {
    async fn run(&self, options: RunOptions) -> Result<RunOutcome, RuntimeError> {
        options.events.started();
        let response = reqwest::get(&options.file_url)
            .await
            .map_err(|e| RuntimeError::launch("fetch", e))?;
        let namespace: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RuntimeError::Protocol(e.to_string()))?;
        Ok(RunOutcome::completed(namespace))
    }

    async fn stop(&self, _request: StopRequest) -> StopOutcome {
        StopOutcome::AlreadyExited
    }
}

#[tokio::test]
async fn test_in_process_server_serves_job_then_goes_away() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let origin = format!("http://{}", listener.local_addr().unwrap());
    let starter = Arc::new(StaticServer {
        listener: Mutex::new(Some(listener)),
    });

    let server = ensure_server_reachable(
        ServerSource::InProcess(starter),
        &origin,
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(server.started());

    let mut plan = TestPlan::new();
    plan.add(
        format!("{origin}/a.test.mjs"),
        "fetch",
        JobEntry::new(Arc::new(FetchRuntime)),
    );
    let output = run_plan(&plan, PlanOptions::default(), &mut NoopObserver).await;
    let result = output.report.results().next().unwrap();
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.namespace, Some(json!({"default": "ok"})));

    let stopped = server.stop_within(Duration::from_secs(1)).await;
    assert!(matches!(stopped, StopOutcome::Graceful | StopOutcome::Forced));
    let probe = LivenessProbe::new(&origin).unwrap();
    assert!(!probe.is_reachable().await);
}

#[tokio::test]
async fn test_already_reachable_origin_starts_nothing() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let origin = format!("http://{}", listener.local_addr().unwrap());
    let running = ensure_server_reachable(
        ServerSource::InProcess(Arc::new(StaticServer {
            listener: Mutex::new(Some(listener)),
        })),
        &origin,
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    // The command would fail if it were spawned.
    let again = ensure_server_reachable(
        ServerSource::command("exit 1"),
        &origin,
        Duration::from_millis(200),
    )
    .await
    .unwrap();
    assert!(!again.started());
    assert_eq!(again.stop().await, StopOutcome::AlreadyExited);

    running.stop_within(Duration::from_secs(1)).await;
}
