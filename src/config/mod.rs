//! TOML configuration for the `jobmatrix` CLI.
//!
//! ```toml
//! [runner]
//! concurrency_limit = 4
//!
//! [defaults]
//! allocated_ms = 10000
//!
//! [runtimes.node]
//! kind = "process"
//! program = "node"
//! args = ["worker.mjs"]
//!
//! [plan."tests/a.test.mjs"]
//! runtimes = ["node"]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::execution::TimeBudget;
use crate::plan::{JobDefaults, JobEntry, PlanOptions, TestPlan, DEFAULT_CONCURRENCY_LIMIT};
use crate::runtime::process::{ProcessRuntime, WorkerCommand};
use crate::runtime::session::SessionRuntime;
use crate::runtime::RuntimeAdapter;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "JOBMATRIX_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "jobmatrix.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default)]
    pub runner: RunnerSection,
    #[serde(default)]
    pub defaults: JobDefaults,
    #[serde(default)]
    pub runtimes: BTreeMap<String, RuntimeConfig>,
    #[serde(default)]
    pub plan: PlanSection,
}

impl RunnerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), files = config.plan.0.len(), "loaded configuration");
        Ok(config)
    }

    /// Try, in order: the file named by `JOBMATRIX_CONFIG`, `./jobmatrix.toml`,
    /// then compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "JOBMATRIX_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local_path = Path::new(DEFAULT_CONFIG_FILE);
        if local_path.exists() {
            match Self::load(local_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local_path.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Resolve runtime labels and build the plan in file order.
    pub fn build_plan(&self) -> Result<TestPlan> {
        let mut adapters: BTreeMap<&str, Arc<dyn RuntimeAdapter>> = BTreeMap::new();
        for (label, runtime) in &self.runtimes {
            adapters.insert(label.as_str(), runtime.build(label));
        }

        let mut plan = TestPlan::with_defaults(self.defaults.clone());
        for (file, entry) in &self.plan.0 {
            if entry.runtimes.is_empty() {
                bail!("plan entry '{}' lists no runtimes", file);
            }
            for label in &entry.runtimes {
                let Some(adapter) = adapters.get(label.as_str()) else {
                    bail!("plan entry '{}' uses unknown runtime '{}'", file, label);
                };
                plan.add(file.clone(), label.clone(), entry.to_job_entry(adapter.clone()));
            }
        }
        Ok(plan)
    }

    pub fn plan_options(&self) -> PlanOptions {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let root_directory = match &self.runner.root_directory {
            Some(root) => base.join(root),
            None => base,
        };
        PlanOptions {
            concurrency_limit: self.runner.concurrency_limit,
            coverage_directory: root_directory.join(&self.runner.coverage_directory),
            root_directory,
            grace_period: Duration::from_millis(self.runner.grace_period_ms),
            mirror_console: self.runner.mirror_console,
            signal: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSection {
    /// Maximum number of jobs in flight.
    pub concurrency_limit: usize,
    /// Grace period between a graceful stop and a forced one.
    pub grace_period_ms: u64,
    /// Relative to `root_directory`.
    pub coverage_directory: PathBuf,
    /// Relative to the working directory. Defaults to it.
    pub root_directory: Option<PathBuf>,
    pub mirror_console: bool,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            grace_period_ms: 4000,
            coverage_directory: PathBuf::from(".coverage/tmp"),
            root_directory: None,
            mirror_console: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Runtimes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeConfig {
    /// One worker process per job.
    Process {
        /// Runtime name; defaults to the table's label.
        #[serde(default)]
        name: Option<String>,
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
        #[serde(default = "default_version")]
        version: String,
    },
    /// One automation session per job on a running controller.
    Session {
        #[serde(default)]
        name: Option<String>,
        /// `host:port` of the controller.
        controller: String,
        #[serde(default = "default_version")]
        version: String,
    },
}

fn default_version() -> String {
    "unknown".to_string()
}

impl RuntimeConfig {
    fn build(&self, label: &str) -> Arc<dyn RuntimeAdapter> {
        match self {
            RuntimeConfig::Process {
                name,
                program,
                args,
                env,
                cwd,
                version,
            } => {
                let command = WorkerCommand {
                    program: program.clone(),
                    args: args.clone(),
                    env: env.clone(),
                    cwd: cwd.clone(),
                };
                Arc::new(ProcessRuntime::new(
                    name.as_deref().unwrap_or(label),
                    version.clone(),
                    command,
                ))
            }
            RuntimeConfig::Session {
                name,
                controller,
                version,
            } => Arc::new(SessionRuntime::new(
                name.as_deref().unwrap_or(label),
                version.clone(),
                controller.clone(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// One `[plan."<file>"]` table. Overrides apply to every listed runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanFileConfig {
    pub runtimes: Vec<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_ms: Option<TimeBudget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_running: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_console: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_coverage: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect_performance: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measure_memory_usage: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_console: Option<bool>,
}

impl PlanFileConfig {
    fn to_job_entry(&self, runtime: Arc<dyn RuntimeAdapter>) -> JobEntry {
        let mut entry = JobEntry::new(runtime).params(self.params.clone());
        if let Some(budget) = self.allocated_ms {
            entry = entry.allocated(budget);
        }
        let toggles: [(Option<bool>, fn(JobEntry, bool) -> JobEntry); 6] = [
            (self.keep_running, JobEntry::keep_running),
            (self.collect_console, JobEntry::collect_console),
            (self.collect_coverage, JobEntry::collect_coverage),
            (self.collect_performance, JobEntry::collect_performance),
            (self.measure_memory_usage, JobEntry::measure_memory_usage),
            (self.mirror_console, JobEntry::mirror_console),
        ];
        for (value, set) in toggles {
            if let Some(value) = value {
                entry = set(entry, value);
            }
        }
        entry
    }
}

/// `[plan]` tables in document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanSection(pub Vec<(String, PlanFileConfig)>);

impl Serialize for PlanSection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (file, entry) in &self.0 {
            map.serialize_entry(file, entry)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PlanSection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PlanVisitor;

        impl<'de> Visitor<'de> for PlanVisitor {
            type Value = PlanSection;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a table of test files")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<PlanSection, A::Error> {
                let mut entries: Vec<(String, PlanFileConfig)> = Vec::new();
                while let Some((file, entry)) = access.next_entry::<String, PlanFileConfig>()? {
                    match entries.iter_mut().find(|(key, _)| *key == file) {
                        Some(slot) => slot.1 = entry,
                        None => entries.push((file, entry)),
                    }
                }
                Ok(PlanSection(entries))
            }
        }

        deserializer.deserialize_map(PlanVisitor)
    }
}
