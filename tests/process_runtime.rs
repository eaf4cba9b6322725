//! Worker process runtime against small `sh` workers.
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use jobmatrix::execution::{ExecutionResult, TimeBudget};
use jobmatrix::plan::{run_plan, JobEntry, NoopObserver, PlanOptions, TestPlan};
use jobmatrix::runtime::process::{ProcessRuntime, WorkerCommand};
use jobmatrix::runtime::{ConsoleKind, ExecutionStatus, RuntimeAdapter};
use serde_json::json;

const READY: &str = r#"printf '%s\n' '{"jobmatrix":1,"type":"ready"}'"#;

fn worker(script: &str) -> Arc<dyn RuntimeAdapter> {
    Arc::new(ProcessRuntime::new(
        "sh-worker",
        "1",
        WorkerCommand::new("sh").arg("-c").arg(script),
    ))
}

async fn run_one(entry: JobEntry, options: PlanOptions) -> ExecutionResult {
    let mut plan = TestPlan::new();
    plan.add("suite/a.test", "sh", entry);
    let output = run_plan(&plan, options, &mut NoopObserver).await;
    output
        .report
        .get("suite/a.test", "sh")
        .cloned()
        .expect("job should have settled")
}

fn options() -> PlanOptions {
    PlanOptions {
        grace_period: Duration::from_millis(300),
        ..PlanOptions::default()
    }
}

#[tokio::test]
async fn test_worker_completes_after_ready_handshake() {
    let script = format!(
        r#"{READY}
read -r line
echo "hello from worker"
echo "$line" >&2
printf '%s\n' '{{"jobmatrix":1,"type":"action-result","data":{{"status":"action-completed","value":{{"namespace":{{"default":"ok"}}}}}}}}'
"#
    );
    let result = run_one(JobEntry::new(worker(&script)), options()).await;

    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.errors);
    assert_eq!(result.namespace, Some(json!({"default": "ok"})));
    let calls = result.console_calls.unwrap();
    assert!(calls
        .iter()
        .any(|c| c.kind == ConsoleKind::Log && c.text == "hello from worker\n"));
    let action_echo = calls
        .iter()
        .find(|c| c.kind == ConsoleKind::Error)
        .expect("action line echoed on stderr");
    assert!(action_echo.text.contains(r#""type":"action""#));
    assert!(action_echo.text.contains(r#""exitAfterAction":true"#));
    assert!(action_echo.text.contains("suite/a.test"));
    assert!(result.timings.runtime_start.is_some());
}

#[tokio::test]
async fn test_failed_action_is_failed() {
    let script = format!(
        r#"{READY}
read -r line
printf '%s\n' '{{"jobmatrix":1,"type":"action-result","data":{{"status":"action-failed","error":{{"name":"AssertionError","message":"1 != 2"}}}}}}'
"#
    );
    let result = run_one(JobEntry::new(worker(&script)), options()).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.errors[0].name, "AssertionError");
    assert_eq!(result.errors[0].message, "1 != 2");
}

#[tokio::test]
async fn test_exit_code_before_ready_is_disconnected() {
    let result = run_one(JobEntry::new(worker("exit 3")), options()).await;
    assert_eq!(result.status, ExecutionStatus::Disconnected);
    assert_eq!(result.errors[0].message, "worker process exited with code 3");
}

#[tokio::test]
async fn test_clean_exit_while_pending_is_disconnected() {
    let script = format!("{READY}\nread -r line\nexit 0\n");
    let result = run_one(JobEntry::new(worker(&script)), options()).await;
    assert_eq!(result.status, ExecutionStatus::Disconnected);
    assert_eq!(result.errors[0].message, "worker process disconnected");
}

#[tokio::test]
async fn test_debug_port_exit_code_is_failed() {
    let result = run_one(JobEntry::new(worker("exit 12")), options()).await;
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result.errors[0].message.contains("code 12"));
}

#[tokio::test]
async fn test_hanging_worker_times_out_and_is_stopped() {
    let script = format!("{READY}\nread -r line\nsleep 30\n");
    let started = Instant::now();
    let result = run_one(
        JobEntry::new(worker(&script)).allocated(TimeBudget::from_ms(300)),
        options(),
    )
    .await;

    assert_eq!(result.status, ExecutionStatus::Timedout);
    assert_eq!(result.errors[0].message, "execution timeout after 300ms");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.timings.runtime_end.is_some());
}

/// Shell that prints `n` filler characters without a newline.
fn filler(n: usize) -> String {
    format!("head -c {n} /dev/zero | tr '\\0' a")
}

#[tokio::test]
async fn test_over_long_result_line_is_failed_not_disconnected() {
    let script = format!(
        r#"{READY}
read -r line
printf '%s' '{{"jobmatrix":1,"type":"action-result","data":{{"status":"action-completed","value":{{"namespace":{{"default":"'
{}
printf '%s\n' '"}}}}}}}}'
exit 0
"#,
        filler(1_100_000)
    );
    let result = run_one(JobEntry::new(worker(&script)), options()).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.errors[0].name, "ProtocolError");
    assert_eq!(result.errors[0].message, "action-result exceeded 1048576 bytes");
}

#[tokio::test]
async fn test_memory_measurement_flag_reaches_worker() {
    let script = format!(
        r#"{READY}
read -r line
case "$line" in
  *'"measureMemoryUsage":true'*) printf '%s\n' '{{"jobmatrix":1,"type":"action-result","data":{{"status":"action-completed","value":{{"namespace":{{}},"memoryUsage":2048}}}}}}' ;;
  *) printf '%s\n' '{{"jobmatrix":1,"type":"action-result","data":{{"status":"action-completed","value":{{"namespace":{{}}}}}}}}' ;;
esac
"#
    );
    let measured = run_one(JobEntry::new(worker(&script)).measure_memory_usage(true), options()).await;
    assert_eq!(measured.status, ExecutionStatus::Completed, "{:?}", measured.errors);
    assert_eq!(measured.memory_usage, Some(2048));

    let unmeasured = run_one(JobEntry::new(worker(&script)), options()).await;
    assert_eq!(unmeasured.memory_usage, None);
}

#[tokio::test]
async fn test_worker_gets_coverage_file_path() {
    let dir = tempfile::tempdir().unwrap();
    let script = format!(
        r#"{READY}
read -r line
printf '{{}}' > "$JOBMATRIX_COVERAGE_FILE"
printf '%s\n' '{{"jobmatrix":1,"type":"action-result","data":{{"status":"action-completed","value":{{"namespace":{{}}}}}}}}'
"#
    );
    let plan_options = PlanOptions {
        root_directory: dir.path().to_path_buf(),
        coverage_directory: dir.path().join(".coverage").join("tmp"),
        ..options()
    };
    let result = run_one(JobEntry::new(worker(&script)).collect_coverage(true), plan_options).await;

    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.errors);
    let coverage = result.coverage_file_ref.unwrap();
    assert!(coverage.starts_with(dir.path().join(".coverage").join("tmp")));
    assert!(coverage.file_name().unwrap().to_string_lossy().starts_with("sh-worker-"));
    assert_eq!(std::fs::read_to_string(coverage).unwrap(), "{}");
}
