//! Test plans and the bounded-concurrency plan runner.

pub mod report;
pub mod summary;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::abort::{AbortOperation, AbortSignal};
use crate::execution::{
    run_execution, ExecutionOutput, ExecutionResult, ExecutionSettings, JobSpec, KeptRuntime,
    TimeBudget, DEFAULT_GRACE_PERIOD,
};
use crate::runtime::{epoch_ms, panic_message, RuntimeAdapter};

pub use self::report::TestPlanReport;
pub use self::summary::TestPlanSummary;

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 5;

/// Plan-level defaults merged under every entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    #[serde(rename = "allocated_ms")]
    pub allocated: TimeBudget,
    pub keep_running: bool,
    pub collect_console: bool,
    pub collect_coverage: bool,
    pub collect_performance: bool,
    pub measure_memory_usage: bool,
    pub mirror_console: bool,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            allocated: TimeBudget::default(),
            keep_running: false,
            collect_console: true,
            collect_coverage: false,
            collect_performance: false,
            measure_memory_usage: false,
            mirror_console: false,
        }
    }
}

/// One (file, runtime) entry as written in a plan. Unset fields fall back
/// to the plan's [`JobDefaults`].
#[derive(Clone)]
pub struct JobEntry {
    runtime: Arc<dyn RuntimeAdapter>,
    runtime_params: serde_json::Map<String, serde_json::Value>,
    allocated: Option<TimeBudget>,
    keep_running: Option<bool>,
    collect_console: Option<bool>,
    collect_coverage: Option<bool>,
    collect_performance: Option<bool>,
    measure_memory_usage: Option<bool>,
    mirror_console: Option<bool>,
}

impl JobEntry {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>) -> Self {
        Self {
            runtime,
            runtime_params: serde_json::Map::new(),
            allocated: None,
            keep_running: None,
            collect_console: None,
            collect_coverage: None,
            collect_performance: None,
            measure_memory_usage: None,
            mirror_console: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.runtime_params.insert(key.into(), value);
        self
    }

    pub fn params(mut self, params: serde_json::Map<String, serde_json::Value>) -> Self {
        self.runtime_params.extend(params);
        self
    }

    pub fn allocated(mut self, budget: TimeBudget) -> Self {
        self.allocated = Some(budget);
        self
    }

    pub fn keep_running(mut self, keep: bool) -> Self {
        self.keep_running = Some(keep);
        self
    }

    pub fn collect_console(mut self, collect: bool) -> Self {
        self.collect_console = Some(collect);
        self
    }

    pub fn collect_coverage(mut self, collect: bool) -> Self {
        self.collect_coverage = Some(collect);
        self
    }

    pub fn collect_performance(mut self, collect: bool) -> Self {
        self.collect_performance = Some(collect);
        self
    }

    pub fn measure_memory_usage(mut self, measure: bool) -> Self {
        self.measure_memory_usage = Some(measure);
        self
    }

    pub fn mirror_console(mut self, mirror: bool) -> Self {
        self.mirror_console = Some(mirror);
        self
    }

    pub fn resolve(&self, defaults: &JobDefaults) -> JobSpec {
        JobSpec {
            runtime: self.runtime.clone(),
            runtime_params: self.runtime_params.clone(),
            allocated: self.allocated.unwrap_or(defaults.allocated),
            keep_running: self.keep_running.unwrap_or(defaults.keep_running),
            collect_console: self.collect_console.unwrap_or(defaults.collect_console),
            collect_coverage: self.collect_coverage.unwrap_or(defaults.collect_coverage),
            collect_performance: self.collect_performance.unwrap_or(defaults.collect_performance),
            measure_memory_usage: self
                .measure_memory_usage
                .unwrap_or(defaults.measure_memory_usage),
            mirror_console: self.mirror_console.unwrap_or(defaults.mirror_console),
        }
    }
}

/// Ordered `file -> runtime label -> entry` mapping.
#[derive(Clone, Default)]
pub struct TestPlan {
    defaults: JobDefaults,
    files: Vec<(String, Vec<(String, JobEntry)>)>,
}

impl TestPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(defaults: JobDefaults) -> Self {
        Self {
            defaults,
            files: Vec::new(),
        }
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.defaults
    }

    /// Add or replace the entry for (`file_key`, `runtime_label`). A
    /// replaced entry keeps its original position.
    pub fn add(
        &mut self,
        file_key: impl Into<String>,
        runtime_label: impl Into<String>,
        entry: JobEntry,
    ) -> &mut Self {
        let file_key = file_key.into();
        let runtime_label = runtime_label.into();
        let runtimes = match self.files.iter().position(|(key, _)| *key == file_key) {
            Some(pos) => &mut self.files[pos].1,
            None => {
                self.files.push((file_key, Vec::new()));
                let last = self.files.len() - 1;
                &mut self.files[last].1
            }
        };
        match runtimes.iter_mut().find(|(label, _)| *label == runtime_label) {
            Some(slot) => slot.1 = entry,
            None => runtimes.push((runtime_label, entry)),
        }
        self
    }

    /// Number of (file, runtime) pairs.
    pub fn len(&self) -> usize {
        self.files.iter().map(|(_, runtimes)| runtimes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(file_key, runtime labels)` in plan order.
    pub fn layout(&self) -> impl Iterator<Item = (&str, Vec<&str>)> {
        self.files.iter().map(|(file, runtimes)| {
            (
                file.as_str(),
                runtimes.iter().map(|(label, _)| label.as_str()).collect(),
            )
        })
    }

    /// Every pair as a [`PlannedJob`], file-major in insertion order.
    pub fn flatten(&self) -> Vec<PlannedJob> {
        let mut jobs = Vec::with_capacity(self.len());
        for (file_key, runtimes) in &self.files {
            for (runtime_label, entry) in runtimes {
                jobs.push(PlannedJob {
                    index: jobs.len(),
                    file_key: file_key.clone(),
                    runtime_label: runtime_label.clone(),
                    spec: entry.resolve(&self.defaults),
                });
            }
        }
        jobs
    }
}

impl std::fmt::Debug for TestPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.layout())
            .finish()
    }
}

/// A job as scheduled: created once per pair, never modified.
#[derive(Debug, Clone)]
pub struct PlannedJob {
    pub index: usize,
    pub file_key: String,
    pub runtime_label: String,
    pub spec: JobSpec,
}

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub concurrency_limit: usize,
    pub root_directory: PathBuf,
    pub coverage_directory: PathBuf,
    pub grace_period: Duration,
    /// Mirror console output of every job, whatever its own setting.
    pub mirror_console: bool,
    pub signal: Option<AbortSignal>,
}

impl Default for PlanOptions {
    fn default() -> Self {
        let root_directory = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            coverage_directory: root_directory.join(".coverage").join("tmp"),
            root_directory,
            grace_period: DEFAULT_GRACE_PERIOD,
            mirror_console: false,
            signal: None,
        }
    }
}

/// What observers learn about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionMeta {
    pub index: usize,
    pub file_key: String,
    pub runtime_label: String,
    pub runtime_name: String,
    /// 1-based start order.
    pub execution_number: usize,
    /// Number of jobs in the plan.
    pub execution_count: usize,
}

/// Hooks called from the runner task, never concurrently.
pub trait ExecutionObserver {
    fn before_execution(&mut self, _meta: &ExecutionMeta) {}

    fn after_execution(&mut self, _meta: &ExecutionMeta, _result: &ExecutionResult) {}
}

#[derive(Debug, Default)]
pub struct NoopObserver;

impl ExecutionObserver for NoopObserver {}

#[derive(Debug)]
pub struct PlanOutput {
    pub report: TestPlanReport,
    pub summary: TestPlanSummary,
    /// Runtimes of `keep_running` jobs, left for the caller to stop.
    pub kept_runtimes: Vec<KeptRuntime>,
}

/// Run every job of `plan`, at most `options.concurrency_limit` at a time.
pub async fn run_plan(
    plan: &TestPlan,
    options: PlanOptions,
    observer: &mut dyn ExecutionObserver,
) -> PlanOutput {
    let jobs = plan.flatten();
    let execution_count = jobs.len();
    let limit = options.concurrency_limit.max(1);
    let batch = AbortOperation::start(options.signal.as_ref());
    let settings = ExecutionSettings {
        root_directory: options.root_directory.clone(),
        coverage_directory: options.coverage_directory.clone(),
        grace_period: options.grace_period,
    };

    if jobs.iter().any(|job| job.spec.collect_coverage) {
        if let Err(e) = std::fs::create_dir_all(&settings.coverage_directory) {
            warn!(dir = %settings.coverage_directory.display(), error = %e, "failed to create coverage directory");
        }
    }

    info!(jobs = execution_count, concurrency = limit, "plan starting");
    let start_ms = epoch_ms();
    let mut runner = Settlements {
        report: TestPlanReport::for_plan(plan),
        started: HashMap::new(),
        kept: Vec::new(),
    };
    let mut active: JoinSet<(usize, ExecutionOutput)> = JoinSet::new();

    for job in jobs {
        while active.len() >= limit {
            if let Some(joined) = active.join_next().await {
                runner.settle(joined, observer);
            }
        }
        if batch.is_aborted() {
            break;
        }

        let meta = ExecutionMeta {
            index: job.index,
            file_key: job.file_key.clone(),
            runtime_label: job.runtime_label.clone(),
            runtime_name: job.spec.runtime.identity().name,
            execution_number: runner.started.len() + 1,
            execution_count,
        };
        observer.before_execution(&meta);
        runner.started.insert(job.index, meta);

        let signal = batch.signal();
        let settings = settings.clone();
        let mut spec = job.spec;
        spec.mirror_console |= options.mirror_console;
        let file_key = job.file_key;
        let index = job.index;
        active.spawn(async move {
            let output = AssertUnwindSafe(run_execution(&file_key, &spec, &signal, &settings))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| ExecutionOutput::crashed(panic_message(panic.as_ref())));
            (index, output)
        });
    }

    while let Some(joined) = active.join_next().await {
        runner.settle(joined, observer);
    }
    batch.end();

    let end_ms = epoch_ms();
    let summary = TestPlanSummary::fold(execution_count, runner.report.results(), start_ms, end_ms);
    info!(summary = %summary.describe(), "plan finished");

    PlanOutput {
        report: runner.report,
        summary,
        kept_runtimes: runner.kept,
    }
}

struct Settlements {
    report: TestPlanReport,
    started: HashMap<usize, ExecutionMeta>,
    kept: Vec<KeptRuntime>,
}

impl Settlements {
    fn settle(
        &mut self,
        joined: Result<(usize, ExecutionOutput), tokio::task::JoinError>,
        observer: &mut dyn ExecutionObserver,
    ) {
        let (index, output) = match joined {
            Ok(settled) => settled,
            Err(e) => {
                // Executions contain their own panics; this is a runner bug.
                error!(error = %e, "execution task lost");
                return;
            }
        };
        let Some(meta) = self.started.get(&index) else {
            error!(index, "settled execution was never started");
            return;
        };
        debug!(file = %meta.file_key, runtime = %meta.runtime_label, status = %output.result.status, "execution recorded");
        observer.after_execution(meta, &output.result);
        if let Some(kept) = output.kept {
            self.kept.push(kept);
        }
        self.report
            .insert(&meta.file_key, &meta.runtime_label, output.result);
    }
}
