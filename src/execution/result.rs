//! The single result shape every execution settles into.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::runtime::{ConsoleCall, ExecutionError, ExecutionStatus};

/// Milliseconds relative to `origin`, which is itself an epoch timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTimings {
    pub origin: f64,
    pub start: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_end: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_end: Option<f64>,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub errors: Vec<ExecutionError>,
    pub namespace: Option<serde_json::Value>,
    pub console_calls: Option<Vec<ConsoleCall>>,
    pub timings: ExecutionTimings,
    pub memory_usage: Option<u64>,
    pub performance: Option<serde_json::Value>,
    pub coverage_file_ref: Option<PathBuf>,
}

impl ExecutionResult {
    pub(crate) fn new(status: ExecutionStatus, timings: ExecutionTimings) -> Self {
        Self {
            status,
            errors: Vec::new(),
            namespace: None,
            console_calls: None,
            timings,
            memory_usage: None,
            performance: None,
            coverage_file_ref: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Wall-clock duration from start to end in milliseconds.
    pub fn duration_ms(&self) -> f64 {
        (self.timings.end - self.timings.start).max(0.0)
    }
}
