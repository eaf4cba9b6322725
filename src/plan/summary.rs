use serde::{Deserialize, Serialize};

use crate::execution::ExecutionResult;
use crate::runtime::ExecutionStatus;

/// Counters for one plan run. The six status counters always sum to
/// `execution_count`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPlanSummary {
    pub execution_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    pub timedout_count: usize,
    pub aborted_count: usize,
    pub disconnected_count: usize,
    /// Planned jobs that never started.
    pub cancelled_count: usize,
    pub start_ms: f64,
    pub end_ms: f64,
}

impl TestPlanSummary {
    pub fn fold<'a>(
        execution_count: usize,
        results: impl IntoIterator<Item = &'a ExecutionResult>,
        start_ms: f64,
        end_ms: f64,
    ) -> Self {
        let mut summary = results.into_iter().fold(
            TestPlanSummary {
                execution_count,
                start_ms,
                end_ms,
                ..TestPlanSummary::default()
            },
            |mut summary, result| {
                match result.status {
                    ExecutionStatus::Completed => summary.completed_count += 1,
                    ExecutionStatus::Failed => summary.failed_count += 1,
                    ExecutionStatus::Timedout => summary.timedout_count += 1,
                    ExecutionStatus::Aborted => summary.aborted_count += 1,
                    ExecutionStatus::Disconnected => summary.disconnected_count += 1,
                }
                summary
            },
        );
        summary.cancelled_count = execution_count.saturating_sub(summary.settled_count());
        summary
    }

    pub fn settled_count(&self) -> usize {
        self.completed_count
            + self.failed_count
            + self.timedout_count
            + self.aborted_count
            + self.disconnected_count
    }

    pub fn passed(&self) -> bool {
        self.completed_count == self.execution_count
    }

    pub fn duration_ms(&self) -> f64 {
        (self.end_ms - self.start_ms).max(0.0)
    }

    /// One-line human summary, e.g. `4 executions: 3 completed, 1 failed (1.2s)`.
    pub fn describe(&self) -> String {
        if self.execution_count == 0 {
            return "no executions".to_string();
        }
        let parts: Vec<String> = [
            (self.completed_count, "completed"),
            (self.failed_count, "failed"),
            (self.timedout_count, "timed out"),
            (self.aborted_count, "aborted"),
            (self.disconnected_count, "disconnected"),
            (self.cancelled_count, "cancelled"),
        ]
        .iter()
        .filter(|(count, _)| *count > 0)
        .map(|(count, label)| format!("{count} {label}"))
        .collect();
        let noun = if self.execution_count == 1 { "execution" } else { "executions" };
        format!(
            "{} {}: {} ({:.1}s)",
            self.execution_count,
            noun,
            parts.join(", "),
            self.duration_ms() / 1000.0
        )
    }
}
