use serde::{Deserialize, Serialize};

use crate::runtime::{ConsoleCall, ExecutionError, ExecutionStatus, RunOutcome, RunTimings};

pub const SESSION_PROTOCOL_VERSION: &str = "1.0";

/// Every frame exchanged with an automation controller.
///
/// Client -> controller: `Hello`, `Open`, `Close`.
/// Controller -> client: `Welcome`, `Opened`, `Console`, `PageError`,
/// `Outcome`, `Closed`, `Error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionMessage {
    Hello(Hello),
    Welcome(Welcome),
    Open(OpenRequest),
    Opened(Opened),
    Console(ConsoleCall),
    PageError(ExecutionError),
    Outcome(SessionOutcome),
    Close,
    Closed,
    Error(ErrorResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub version: String,
    pub client: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub version: String,
    pub controller: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub file_url: String,
    pub collect_console: bool,
    pub collect_performance: bool,
    #[serde(default)]
    pub measure_memory_usage: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage_file: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Opened {
    pub session_id: String,
}

/// Final report of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub namespace: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<ExecutionError>,
    #[serde(default)]
    pub timings: Option<RunTimings>,
    /// Bytes, present when the session was opened with `measure_memory_usage`.
    #[serde(default)]
    pub memory_usage: Option<u64>,
    #[serde(default)]
    pub performance: Option<serde_json::Value>,
}

impl From<SessionOutcome> for RunOutcome {
    fn from(outcome: SessionOutcome) -> Self {
        RunOutcome {
            status: outcome.status,
            namespace: outcome.namespace,
            errors: outcome.errors,
            timings: outcome.timings,
            memory_usage: outcome.memory_usage,
            performance: outcome.performance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub message: String,
}
