//! Values a runtime reports back about one execution.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Timedout,
    Aborted,
    Disconnected,
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Timedout => write!(f, "timedout"),
            ExecutionStatus::Aborted => write!(f, "aborted"),
            ExecutionStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// A serializable error attached to an execution result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ExecutionError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// Console method a call came from. Methods without a variant of their own
/// (`table`, `trace`, `dir`, ...) are kept verbatim in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConsoleKind {
    Log,
    Info,
    Debug,
    Warn,
    Error,
    Other(String),
}

impl ConsoleKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "log" => ConsoleKind::Log,
            "info" => ConsoleKind::Info,
            "debug" => ConsoleKind::Debug,
            "warn" | "warning" => ConsoleKind::Warn,
            "error" => ConsoleKind::Error,
            other => ConsoleKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ConsoleKind::Log => "log",
            ConsoleKind::Info => "info",
            ConsoleKind::Debug => "debug",
            ConsoleKind::Warn => "warn",
            ConsoleKind::Error => "error",
            ConsoleKind::Other(name) => name,
        }
    }

    /// Whether mirrored output belongs on stderr.
    pub fn is_stderr(&self) -> bool {
        matches!(self, ConsoleKind::Warn | ConsoleKind::Error)
    }
}

impl Serialize for ConsoleKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConsoleKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(ConsoleKind::from_name(&name))
    }
}

/// One console call, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleCall {
    #[serde(rename = "type")]
    pub kind: ConsoleKind,
    pub text: String,
}

impl ConsoleCall {
    pub fn new(kind: ConsoleKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

/// Timestamps reported by the runtime itself, in epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTimings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_start: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_end: Option<f64>,
}

/// What a runtime instance resolves with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub namespace: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<ExecutionError>,
    #[serde(default)]
    pub timings: Option<RunTimings>,
    #[serde(default)]
    pub memory_usage: Option<u64>,
    #[serde(default)]
    pub performance: Option<serde_json::Value>,
}

impl RunOutcome {
    pub fn completed(namespace: serde_json::Value) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            namespace: Some(namespace),
            errors: Vec::new(),
            timings: None,
            memory_usage: None,
            performance: None,
        }
    }

    pub fn failed(error: ExecutionError) -> Self {
        Self::with_status(ExecutionStatus::Failed, vec![error])
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::with_status(
            ExecutionStatus::Disconnected,
            vec![ExecutionError::new("DisconnectedError", message)],
        )
    }

    pub fn aborted() -> Self {
        Self::with_status(ExecutionStatus::Aborted, Vec::new())
    }

    fn with_status(status: ExecutionStatus, errors: Vec<ExecutionError>) -> Self {
        Self {
            status,
            namespace: None,
            errors,
            timings: None,
            memory_usage: None,
            performance: None,
        }
    }
}
