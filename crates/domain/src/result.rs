use serde::{Deserialize, Serialize};

/// Result of one `run` on a session or executor.
///
/// User-code failure never surfaces as an `Err` — it lands in `error` so
/// callers can always read stdout and timing from a failed run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// JSON projection of the trailing expression value, if any.
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub elapsed_ms: f64,
}

impl ExecutionResult {
    pub fn ok(value: Option<serde_json::Value>, stdout: String) -> Self {
        Self {
            value,
            stdout,
            error: None,
            elapsed_ms: 0.0,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            value: None,
            stdout: String::new(),
            error: Some(message.into()),
            elapsed_ms: 0.0,
        }
    }

    pub fn success(&self) -> bool {
        self.error.is_none()
    }
}
