//! Execution: one (file, runtime) job through its whole lifecycle.
//!
//! [`run_execution`] never fails. Whatever happens in the runtime (a
//! rejected run, a panic, a hang, a lost worker) ends up in the returned
//! [`ExecutionResult`], and the runtime instance is always stopped unless the
//! job asked to keep it running.

pub mod result;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::abort::{AbortOperation, AbortSignal};
use crate::runtime::{
    epoch_ms, panic_message, ConsoleCall, ExecutionError, ExecutionStatus, RunOptions,
    RuntimeAdapter, RuntimeEvent, RuntimeEvents, RuntimeIdentity, RuntimeInstance, StopOutcome,
    StopRequest,
};

pub use self::result::{ExecutionResult, ExecutionTimings};

/// Default grace period between a graceful stop and a forced one.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(4000);

/// Time a job may run before it is marked `timedout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBudget {
    Limited(Duration),
    Unlimited,
}

impl TimeBudget {
    pub fn from_ms(ms: u64) -> Self {
        TimeBudget::Limited(Duration::from_millis(ms))
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            TimeBudget::Limited(d) => Some(*d),
            TimeBudget::Unlimited => None,
        }
    }
}

impl Default for TimeBudget {
    fn default() -> Self {
        TimeBudget::from_ms(30_000)
    }
}

impl std::fmt::Display for TimeBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeBudget::Limited(d) => write!(f, "{}ms", d.as_millis()),
            TimeBudget::Unlimited => write!(f, "infinite"),
        }
    }
}

// Milliseconds as a number, or the string "infinite".
impl Serialize for TimeBudget {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TimeBudget::Limited(d) => serializer.serialize_u64(d.as_millis() as u64),
            TimeBudget::Unlimited => serializer.serialize_str("infinite"),
        }
    }
}

impl<'de> Deserialize<'de> for TimeBudget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Ms(u64),
            Word(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Ms(ms) => Ok(TimeBudget::from_ms(ms)),
            Repr::Word(word) if word == "infinite" || word == "unlimited" => {
                Ok(TimeBudget::Unlimited)
            }
            Repr::Word(word) => Err(serde::de::Error::custom(format!(
                "invalid time budget '{word}', expected milliseconds or \"infinite\""
            ))),
        }
    }
}

/// Everything needed to run one job.
#[derive(Clone)]
pub struct JobSpec {
    pub runtime: Arc<dyn RuntimeAdapter>,
    pub runtime_params: serde_json::Map<String, serde_json::Value>,
    pub allocated: TimeBudget,
    pub keep_running: bool,
    pub collect_console: bool,
    pub collect_coverage: bool,
    pub collect_performance: bool,
    pub measure_memory_usage: bool,
    /// Write console output to this process's stdout/stderr as it arrives.
    pub mirror_console: bool,
}

impl JobSpec {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self {
            runtime,
            runtime_params: serde_json::Map::new(),
            allocated: TimeBudget::default(),
            keep_running: false,
            collect_console: true,
            collect_coverage: false,
            collect_performance: false,
            measure_memory_usage: false,
            mirror_console: false,
        }
    }

    /// The timeout to enforce, if any.
    pub fn timeout(&self) -> Option<Duration> {
        if self.keep_running {
            return None;
        }
        self.allocated.as_duration()
    }
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("runtime", &self.runtime.identity())
            .field("allocated", &self.allocated)
            .field("keep_running", &self.keep_running)
            .field("collect_console", &self.collect_console)
            .field("collect_coverage", &self.collect_coverage)
            .field("collect_performance", &self.collect_performance)
            .field("measure_memory_usage", &self.measure_memory_usage)
            .field("mirror_console", &self.mirror_console)
            .finish()
    }
}

/// Batch-wide settings shared by every execution.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub root_directory: PathBuf,
    pub coverage_directory: PathBuf,
    pub grace_period: Duration,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        let root_directory = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            coverage_directory: root_directory.join(".coverage").join("tmp"),
            root_directory,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// Lifecycle of one execution. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Pending,
    Starting,
    Running,
    Settled(ExecutionStatus),
}

impl ExecutionState {
    fn rank(&self) -> u8 {
        match self {
            ExecutionState::Pending => 0,
            ExecutionState::Starting => 1,
            ExecutionState::Running => 2,
            ExecutionState::Settled(_) => 3,
        }
    }

    /// Move forward to `next`. Returns false (and stays put) for backward
    /// moves or any move out of a settled state.
    pub fn advance(&mut self, next: ExecutionState) -> bool {
        if matches!(self, ExecutionState::Settled(_)) || next.rank() <= self.rank() {
            return false;
        }
        *self = next;
        true
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, ExecutionState::Settled(_))
    }
}

/// A runtime left alive because its job set `keep_running`.
pub struct KeptRuntime {
    pub file_key: String,
    pub runtime: RuntimeIdentity,
    instance: Arc<dyn RuntimeInstance>,
    grace: Duration,
}

impl KeptRuntime {
    pub async fn stop(&self) -> StopOutcome {
        self.instance.stop(StopRequest { grace: self.grace }).await
    }
}

impl std::fmt::Debug for KeptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeptRuntime")
            .field("file_key", &self.file_key)
            .field("runtime", &self.runtime)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct ExecutionOutput {
    pub result: ExecutionResult,
    /// Present iff the job set `keep_running`.
    pub kept: Option<KeptRuntime>,
}

impl ExecutionOutput {
    /// Result for an execution that could not even be driven.
    pub(crate) fn crashed(message: impl Into<String>) -> Self {
        let mut result = ExecutionResult::new(
            ExecutionStatus::Failed,
            ExecutionTimings {
                origin: epoch_ms(),
                ..ExecutionTimings::default()
            },
        );
        result.errors.push(ExecutionError::new("InternalError", message));
        Self { result, kept: None }
    }
}

/// Which arm of the execution race won.
enum Settled {
    Aborted,
    Resolved(crate::runtime::RunOutcome),
    Rejected(ExecutionError),
}

/// Live destination of mirrored console output.
trait ConsoleMirror: Send {
    fn write(&mut self, call: &ConsoleCall);
}

/// Warn and error calls go to stderr, the rest to stdout.
struct StdioMirror;

impl ConsoleMirror for StdioMirror {
    fn write(&mut self, call: &ConsoleCall) {
        if call.kind.is_stderr() {
            let mut stderr = std::io::stderr().lock();
            let _ = stderr.write_all(call.text.as_bytes());
        } else {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(call.text.as_bytes());
            let _ = stdout.flush();
        }
    }
}

/// Collecting and mirroring are independent of each other.
struct ConsoleCapture {
    calls: Option<Vec<ConsoleCall>>,
    mirror: Option<Box<dyn ConsoleMirror>>,
}

impl ConsoleCapture {
    fn new(collect: bool, mirror: Option<Box<dyn ConsoleMirror>>) -> Self {
        Self {
            calls: collect.then(Vec::new),
            mirror,
        }
    }

    fn for_job(spec: &JobSpec) -> Self {
        let mirror = spec
            .mirror_console
            .then(|| Box::new(StdioMirror) as Box<dyn ConsoleMirror>);
        Self::new(spec.collect_console, mirror)
    }

    fn push(&mut self, call: ConsoleCall) {
        if let Some(mirror) = self.mirror.as_mut() {
            mirror.write(&call);
        }
        if let Some(calls) = self.calls.as_mut() {
            calls.push(call);
        }
    }
}

/// Per-execution bookkeeping fed by runtime events.
struct Tracker {
    clock: Instant,
    state: ExecutionState,
    timings: ExecutionTimings,
    console: ConsoleCapture,
}

impl Tracker {
    fn elapsed_ms(&self) -> f64 {
        self.clock.elapsed().as_secs_f64() * 1000.0
    }

    fn apply(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Console(call) => self.console.push(call),
            RuntimeEvent::RuntimeStarted => {
                if !self.state.advance(ExecutionState::Running) {
                    debug!(state = ?self.state, "runtime reported start after execution settled");
                }
                self.timings.runtime_start = Some(self.elapsed_ms());
            }
            RuntimeEvent::RuntimeStopped => {
                self.timings.runtime_end = Some(self.elapsed_ms());
            }
        }
    }

    fn settle(&mut self, status: ExecutionStatus) {
        let moved = self.state.advance(ExecutionState::Settled(status));
        debug_assert!(moved, "execution settled twice");
    }

    fn drain(&mut self, events: &mut mpsc::UnboundedReceiver<RuntimeEvent>) {
        while let Ok(event) = events.try_recv() {
            self.apply(event);
        }
    }
}

/// URL handed to runtimes for `file_key`.
pub fn file_url_for(root_directory: &Path, file_key: &str) -> String {
    if file_key.contains("://") {
        return file_key.to_string();
    }
    let path = root_directory.join(file_key);
    match reqwest::Url::from_file_path(&path) {
        Ok(url) => url.to_string(),
        Err(()) => format!("file://{}", path.display()),
    }
}

/// A fresh, collision-free coverage file path for one job.
pub fn coverage_file_path(coverage_directory: &Path, runtime_name: &str) -> PathBuf {
    let name: String = runtime_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    coverage_directory.join(format!("{}-{}.json", name, uuid::Uuid::new_v4()))
}

/// Run `file_key` once through a fresh instance of `spec.runtime`.
pub async fn run_execution(
    file_key: &str,
    spec: &JobSpec,
    signal: &AbortSignal,
    settings: &ExecutionSettings,
) -> ExecutionOutput {
    let mut tracker = Tracker {
        clock: Instant::now(),
        state: ExecutionState::Pending,
        timings: ExecutionTimings {
            origin: epoch_ms(),
            ..ExecutionTimings::default()
        },
        console: ConsoleCapture::for_job(spec),
    };
    let origin = tracker.timings.origin;

    let operation = AbortOperation::start(Some(signal));
    let timeout = spec.timeout().map(|after| operation.add_timeout(after));

    let identity = spec.runtime.identity();
    let coverage_file = spec
        .collect_coverage
        .then(|| coverage_file_path(&settings.coverage_directory, &identity.name));
    let instance = spec.runtime.instantiate();
    let (events, mut event_rx) = RuntimeEvents::channel();
    let options = RunOptions {
        signal: operation.signal(),
        file_url: file_url_for(&settings.root_directory, file_key),
        root_directory: settings.root_directory.clone(),
        params: spec.runtime_params.clone(),
        keep_running: spec.keep_running,
        collect_console: spec.collect_console,
        collect_performance: spec.collect_performance,
        measure_memory_usage: spec.measure_memory_usage,
        coverage_file: coverage_file.clone(),
        events,
    };

    tracker.state.advance(ExecutionState::Starting);
    debug!(file = %file_key, runtime = %identity, allocated = %spec.allocated, "execution starting");

    let run_instance = instance.clone();
    let mut run_task = tokio::spawn(async move { run_instance.run(options).await });

    let operation_signal = operation.signal();
    let settled = loop {
        tokio::select! {
            biased;
            _ = operation_signal.aborted() => break Settled::Aborted,
            Some(event) = event_rx.recv() => tracker.apply(event),
            joined = &mut run_task => break match joined {
                Ok(Ok(outcome)) => Settled::Resolved(outcome),
                Ok(Err(e)) => Settled::Rejected(ExecutionError::from(&e)),
                Err(e) if e.is_panic() => Settled::Rejected(ExecutionError::new(
                    "PanicError",
                    panic_message(e.into_panic().as_ref()),
                )),
                Err(e) => Settled::Rejected(ExecutionError::new("InternalError", e.to_string())),
            },
        }
    };
    tracker.drain(&mut event_rx);

    let mut result = match settled {
        Settled::Aborted => {
            let timed_out = timeout
                .as_ref()
                .map(|source| operation.timed_out_by(source))
                .unwrap_or(false);
            if timed_out {
                let mut result = ExecutionResult::new(ExecutionStatus::Timedout, ExecutionTimings::default());
                result.errors.push(ExecutionError::new(
                    "TimeoutError",
                    format!("execution timeout after {}", spec.allocated),
                ));
                result
            } else {
                ExecutionResult::new(ExecutionStatus::Aborted, ExecutionTimings::default())
            }
        }
        Settled::Resolved(outcome) => {
            let mut result = ExecutionResult::new(outcome.status, ExecutionTimings::default());
            result.namespace = outcome.namespace;
            result.errors = outcome.errors;
            result.memory_usage = outcome.memory_usage;
            result.performance = outcome.performance;
            if let Some(timings) = outcome.timings {
                tracker.timings.execution_start = timings.execution_start.map(|t| t - origin);
                tracker.timings.execution_end = timings.execution_end.map(|t| t - origin);
            }
            result
        }
        Settled::Rejected(error) => {
            let mut result = ExecutionResult::new(ExecutionStatus::Failed, ExecutionTimings::default());
            result.errors.push(error);
            result
        }
    };
    tracker.settle(result.status);
    operation.end();

    let kept = if spec.keep_running {
        Some(KeptRuntime {
            file_key: file_key.to_string(),
            runtime: identity.clone(),
            instance,
            grace: settings.grace_period,
        })
    } else {
        let stopped = instance
            .stop(StopRequest {
                grace: settings.grace_period,
            })
            .await;
        if let StopOutcome::Failed(reason) = &stopped {
            warn!(file = %file_key, runtime = %identity, %reason, "failed to stop runtime");
        }
        // The losing run future is not awaited any further.
        run_task.abort();
        None
    };
    tracker.drain(&mut event_rx);

    tracker.timings.end = tracker.elapsed_ms();
    result.timings = tracker.timings;
    result.console_calls = tracker.console.calls;
    result.coverage_file_ref = coverage_file;

    info!(
        file = %file_key,
        runtime = %identity,
        status = %result.status,
        state = ?tracker.state,
        duration_ms = result.duration_ms() as u64,
        "execution settled"
    );
    ExecutionOutput { result, kept }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ConsoleKind, RunOutcome, RuntimeError, StopLatch};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    enum Behavior {
        Resolve(RunOutcome),
        Reject,
        Hang,
        Panic,
    }

    struct FakeRuntime {
        behavior: Behavior,
        stops: Arc<AtomicUsize>,
    }

    struct FakeInstance {
        behavior: Behavior,
        stops: Arc<AtomicUsize>,
        latch: StopLatch,
    }

    impl RuntimeAdapter for FakeRuntime {
        fn identity(&self) -> RuntimeIdentity {
            RuntimeIdentity {
                name: "fake".to_string(),
                version: "0.0.1".to_string(),
            }
        }

        fn instantiate(&self) -> Arc<dyn RuntimeInstance> {
            Arc::new(FakeInstance {
                behavior: self.behavior.clone(),
                stops: self.stops.clone(),
                latch: StopLatch::new(),
            })
        }
    }

    #[async_trait::async_trait]
    impl RuntimeInstance for FakeInstance {
        async fn run(&self, options: RunOptions) -> Result<RunOutcome, RuntimeError> {
            options.events.started();
            options.events.console(ConsoleKind::Log, "first\n");
            options.events.console(ConsoleKind::Error, "second\n");
            match self.behavior.clone() {
                Behavior::Resolve(outcome) => Ok(outcome),
                Behavior::Reject => Err(RuntimeError::launch("fake", "no such binary")),
                Behavior::Hang => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Behavior::Panic => panic!("adapter bug"),
            }
        }

        async fn stop(&self, _request: StopRequest) -> StopOutcome {
            self.latch
                .stop_with(|| async {
                    self.stops.fetch_add(1, Ordering::SeqCst);
                    StopOutcome::Graceful
                })
                .await
        }
    }

    fn spec(behavior: Behavior) -> (JobSpec, Arc<AtomicUsize>) {
        let stops = Arc::new(AtomicUsize::new(0));
        let runtime = FakeRuntime {
            behavior,
            stops: stops.clone(),
        };
        (JobSpec::new(Arc::new(runtime)), stops)
    }

    fn settings(coverage: &Path) -> ExecutionSettings {
        ExecutionSettings {
            root_directory: PathBuf::from("/project"),
            coverage_directory: coverage.to_path_buf(),
            grace_period: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_completed_copies_outcome_and_console_order() {
        let (spec, stops) = spec(Behavior::Resolve(RunOutcome::completed(json!({"default": "ok"}))));
        let signal = AbortSignal::new();
        let output = run_execution("a.test.js", &spec, &signal, &settings(Path::new("/tmp"))).await;
        let result = output.result;

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.namespace, Some(json!({"default": "ok"})));
        assert_eq!(
            result.console_calls,
            Some(vec![
                ConsoleCall::new(ConsoleKind::Log, "first\n"),
                ConsoleCall::new(ConsoleKind::Error, "second\n"),
            ])
        );
        assert!(result.timings.end >= result.timings.start);
        assert!(result.timings.runtime_start.is_some());
        assert!(result.coverage_file_ref.is_none());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(output.kept.is_none());
    }

    #[tokio::test]
    async fn test_rejection_is_failed_with_thrown_error() {
        let (spec, stops) = spec(Behavior::Reject);
        let output = run_execution("a.test.js", &spec, &AbortSignal::new(), &settings(Path::new("/tmp"))).await;

        assert_eq!(output.result.status, ExecutionStatus::Failed);
        assert_eq!(output.result.errors.len(), 1);
        assert_eq!(output.result.errors[0].name, "LaunchError");
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_adapter_panic_is_contained() {
        let (spec, _) = spec(Behavior::Panic);
        let output = run_execution("a.test.js", &spec, &AbortSignal::new(), &settings(Path::new("/tmp"))).await;
        assert_eq!(output.result.status, ExecutionStatus::Failed);
        assert_eq!(output.result.errors[0].message, "adapter bug");
    }

    #[tokio::test]
    async fn test_hang_past_allocation_is_timedout() {
        let (mut spec, stops) = spec(Behavior::Hang);
        spec.allocated = TimeBudget::from_ms(50);
        let output = run_execution("a.test.js", &spec, &AbortSignal::new(), &settings(Path::new("/tmp"))).await;

        assert_eq!(output.result.status, ExecutionStatus::Timedout);
        assert_eq!(output.result.errors[0].message, "execution timeout after 50ms");
        assert!(output.result.timings.end >= 50.0);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_external_abort_is_aborted_not_timedout() {
        let (mut spec, _) = spec(Behavior::Hang);
        spec.allocated = TimeBudget::from_ms(10_000);
        let batch = AbortOperation::root();
        let signal = batch.signal();

        let settings = settings(Path::new("/tmp"));
        let run = run_execution("a.test.js", &spec, &signal, &settings);
        let abort = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            batch.abort();
        };
        let (output, _) = tokio::join!(run, abort);
        assert_eq!(output.result.status, ExecutionStatus::Aborted);
        assert!(output.result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_unlimited_budget_never_times_out() {
        let (mut spec, _) = spec(Behavior::Hang);
        spec.allocated = TimeBudget::Unlimited;
        let batch = AbortOperation::root();
        let signal = batch.signal();

        let settings = settings(Path::new("/tmp"));
        let run = run_execution("a.test.js", &spec, &signal, &settings);
        let abort = async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            batch.abort();
        };
        let (output, _) = tokio::join!(run, abort);
        assert_eq!(output.result.status, ExecutionStatus::Aborted);
    }

    #[tokio::test]
    async fn test_keep_running_skips_timeout_and_stop() {
        let (mut spec, stops) = spec(Behavior::Hang);
        spec.allocated = TimeBudget::from_ms(20);
        spec.keep_running = true;
        let batch = AbortOperation::root();
        let signal = batch.signal();

        let settings = settings(Path::new("/tmp"));
        let run = run_execution("a.test.js", &spec, &signal, &settings);
        let abort = async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            batch.abort();
        };
        let (output, _) = tokio::join!(run, abort);
        assert_eq!(output.result.status, ExecutionStatus::Aborted);
        assert_eq!(stops.load(Ordering::SeqCst), 0);

        let kept = output.kept.expect("runtime should be kept");
        assert_eq!(kept.stop().await, StopOutcome::Graceful);
        assert_eq!(kept.stop().await, StopOutcome::Graceful);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_console_not_collected_when_disabled() {
        let (mut spec, _) = spec(Behavior::Resolve(RunOutcome::completed(json!({}))));
        spec.collect_console = false;
        let output = run_execution("a.test.js", &spec, &AbortSignal::new(), &settings(Path::new("/tmp"))).await;
        assert_eq!(output.result.console_calls, None);
    }

    #[derive(Clone, Default)]
    struct RecordingMirror(Arc<std::sync::Mutex<Vec<ConsoleCall>>>);

    impl ConsoleMirror for RecordingMirror {
        fn write(&mut self, call: &ConsoleCall) {
            self.0.lock().unwrap().push(call.clone());
        }
    }

    #[test]
    fn test_mirror_without_collecting() {
        let mirror = RecordingMirror::default();
        let mut capture = ConsoleCapture::new(false, Some(Box::new(mirror.clone())));
        capture.push(ConsoleCall::new(ConsoleKind::Log, "shown\n"));

        assert_eq!(capture.calls, None);
        assert_eq!(
            *mirror.0.lock().unwrap(),
            vec![ConsoleCall::new(ConsoleKind::Log, "shown\n")]
        );
    }

    #[test]
    fn test_collect_without_mirroring() {
        let mut capture = ConsoleCapture::new(true, None);
        capture.push(ConsoleCall::new(ConsoleKind::Warn, "kept\n"));

        assert!(capture.mirror.is_none());
        assert_eq!(capture.calls, Some(vec![ConsoleCall::new(ConsoleKind::Warn, "kept\n")]));
    }

    #[test]
    fn test_job_flags_pick_capture_mode() {
        let (mut spec, _) = spec(Behavior::Reject);
        spec.collect_console = false;
        spec.mirror_console = true;
        let capture = ConsoleCapture::for_job(&spec);
        assert!(capture.calls.is_none());
        assert!(capture.mirror.is_some());

        spec.collect_console = true;
        spec.mirror_console = false;
        let capture = ConsoleCapture::for_job(&spec);
        assert_eq!(capture.calls, Some(Vec::new()));
        assert!(capture.mirror.is_none());
    }

    #[tokio::test]
    async fn test_coverage_files_are_unique_per_job() {
        let dir = tempfile::tempdir().unwrap();
        let (mut spec, _) = spec(Behavior::Resolve(RunOutcome::completed(json!({}))));
        spec.collect_coverage = true;

        let first = run_execution("a.test.js", &spec, &AbortSignal::new(), &settings(dir.path())).await;
        let second = run_execution("a.test.js", &spec, &AbortSignal::new(), &settings(dir.path())).await;
        let first = first.result.coverage_file_ref.unwrap();
        let second = second.result.coverage_file_ref.unwrap();

        assert_ne!(first, second);
        assert_eq!(first.parent(), Some(dir.path()));
        assert!(first.file_name().unwrap().to_string_lossy().starts_with("fake-"));
    }

    #[test]
    fn test_state_never_leaves_settled() {
        let mut state = ExecutionState::Pending;
        assert!(state.advance(ExecutionState::Starting));
        assert!(state.advance(ExecutionState::Running));
        assert!(!state.advance(ExecutionState::Starting));
        assert!(state.advance(ExecutionState::Settled(ExecutionStatus::Completed)));
        assert!(!state.advance(ExecutionState::Running));
        assert!(!state.advance(ExecutionState::Settled(ExecutionStatus::Failed)));
        assert_eq!(state, ExecutionState::Settled(ExecutionStatus::Completed));
    }

    #[test]
    fn test_time_budget_parses_ms_and_infinite() {
        let limited: TimeBudget = serde_json::from_str("1500").unwrap();
        assert_eq!(limited, TimeBudget::from_ms(1500));
        let unlimited: TimeBudget = serde_json::from_str("\"infinite\"").unwrap();
        assert_eq!(unlimited, TimeBudget::Unlimited);
        assert!(serde_json::from_str::<TimeBudget>("\"soon\"").is_err());
    }

    #[test]
    fn test_file_url_for_relative_key() {
        let url = file_url_for(Path::new("/project"), "tests/a.test.js");
        assert_eq!(url, "file:///project/tests/a.test.js");
        assert_eq!(file_url_for(Path::new("/project"), "http://localhost/a.html"), "http://localhost/a.html");
    }
}
