//! Controller <-> worker message protocol.
//!
//! Worker processes speak newline-delimited JSON on their stdio. Every
//! protocol line carries the `"jobmatrix": 1` marker next to the `type` /
//! `data` fields; lines without it are ordinary program output. Worker
//! threads exchange the same [`IpcMessage`] values over channels.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::{ExecutionError, ExecutionStatus, RunOutcome, RunTimings};

pub const PROTOCOL_MARKER: &str = "jobmatrix";
pub const PROTOCOL_VERSION: u64 = 1;

/// Longest protocol line accepted from a worker (1 MB, one namespace payload).
pub const MAX_LINE_LENGTH: usize = 1_048_576;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed protocol message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unsupported protocol version {0}")]
    Version(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum IpcMessage {
    /// Worker -> controller, once its message listener is installed.
    Ready,
    /// Controller -> worker.
    Action(Action),
    /// Worker -> controller.
    ActionResult(ActionResult),
    /// Controller -> thread worker: leave the message loop.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionType {
    Execute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub action_type: ActionType,
    pub action_params: ActionParams,
}

impl Action {
    pub fn execute(params: ActionParams) -> Self {
        Self {
            action_type: ActionType::Execute,
            action_params: params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionParams {
    pub file_url: String,
    #[serde(default)]
    pub collect_performance: bool,
    #[serde(default)]
    pub exit_after_action: bool,
    /// Report `memoryUsage` in the action result.
    #[serde(default)]
    pub measure_memory_usage: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionStatus {
    ActionCompleted,
    ActionFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ActionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ActionResult {
    pub fn completed(value: ActionValue) -> Self {
        Self {
            status: ActionStatus::ActionCompleted,
            value: Some(value),
            error: None,
        }
    }

    pub fn failed(error: ExecutionError) -> Self {
        Self {
            status: ActionStatus::ActionFailed,
            value: None,
            error: Some(error),
        }
    }

    /// Normalize into the shape every runtime resolves with.
    pub fn into_outcome(self) -> RunOutcome {
        match self.status {
            ActionStatus::ActionCompleted => {
                let value = self.value.unwrap_or_default();
                RunOutcome {
                    status: ExecutionStatus::Completed,
                    namespace: Some(value.namespace),
                    errors: Vec::new(),
                    timings: value.timings,
                    memory_usage: value.memory_usage,
                    performance: value.performance,
                }
            }
            ActionStatus::ActionFailed => RunOutcome::failed(self.error.unwrap_or_else(|| {
                ExecutionError::new("Error", "execution failed without an error payload")
            })),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionValue {
    #[serde(default)]
    pub namespace: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<RunTimings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<serde_json::Value>,
}

/// Serialize `message` as one protocol line (no trailing newline).
pub fn encode_line(message: &IpcMessage) -> Result<String, IpcError> {
    let mut value = serde_json::to_value(message)?;
    if let Some(object) = value.as_object_mut() {
        object.insert(PROTOCOL_MARKER.to_string(), PROTOCOL_VERSION.into());
    }
    Ok(serde_json::to_string(&value)?)
}

/// Parse one line of worker output.
///
/// Returns `Ok(None)` for lines that are not protocol messages.
pub fn decode_line(line: &str) -> Result<Option<IpcMessage>, IpcError> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Ok(None);
    }
    let mut value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return Ok(None),
    };
    let Some(object) = value.as_object_mut() else {
        return Ok(None);
    };
    let version = match object.remove(PROTOCOL_MARKER) {
        Some(marker) => marker.as_u64().unwrap_or(0),
        None => return Ok(None),
    };
    if version != PROTOCOL_VERSION {
        return Err(IpcError::Version(version));
    }
    Ok(Some(serde_json::from_value(value)?))
}
