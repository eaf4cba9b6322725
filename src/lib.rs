//! jobmatrix -- run a matrix of test files against disposable runtimes.
//!
//! Every (file, runtime) pair of a [`plan::TestPlan`] runs once in a fresh
//! runtime instance (a worker process, a worker thread or a remote
//! automation session), under a per-job time budget and a batch-wide abort
//! signal. Results are collected into a [`plan::TestPlanReport`] and folded
//! into a [`plan::TestPlanSummary`].

pub mod abort;
pub mod config;
pub mod execution;
pub mod ipc;
pub mod plan;
pub mod readiness;
pub mod runtime;
pub mod session_proto;
pub mod system;

pub use abort::{AbortOperation, AbortSignal};
pub use execution::{run_execution, ExecutionResult, JobSpec, TimeBudget};
pub use plan::{
    run_plan, ExecutionMeta, ExecutionObserver, JobEntry, PlanOptions, PlanOutput, TestPlan,
    TestPlanReport, TestPlanSummary,
};
pub use runtime::{ExecutionStatus, RuntimeAdapter, RuntimeInstance};
