use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Body returned when serialization of an [`ErrorMessage`] itself fails.
const FALLBACK_ERROR_BODY: &str = r#"{"errorCode":50000,"message":"Internal server error"}"#;

/// Serializable error entity carried in the body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    /// Stable code from the error code registry
    pub error_code:     i32,
    /// Human readable description
    pub message:        String,
    /// Statement that caused the failure, echoed back to the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_text: Option<String>,
    /// Cause chain, only populated in verbose mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace:    Vec<String>,
}

impl ErrorMessage {
    pub fn new(error_code: i32, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            statement_text: None,
            stack_trace: Vec::new(),
        }
    }

    pub fn with_statement_text(mut self, statement: impl Into<String>) -> Self {
        self.statement_text = Some(statement.into());
        self
    }

    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }
}

/// An error entity paired with the transport status it is delivered under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub status: StatusCode,
    pub body:   ErrorMessage,
}

impl ErrorResponse {
    pub fn new(status: StatusCode, body: ErrorMessage) -> Self {
        Self { status, body }
    }

    /// JSON encoding of the body. Never fails; falls back to a fixed generic
    /// server error body.
    pub fn to_json(&self) -> String {
        match serde_json::to_string(&self.body) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!("Failed to serialize error entity: {}", e);
                FALLBACK_ERROR_BODY.to_string()
            }
        }
    }
}

/// A single textual command submitted to the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Command text, e.g. `show topics;`
    pub command:  String,
    /// Caller asks for results to be streamed
    #[serde(default)]
    pub streamed: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command:  command.into(),
            streamed: false,
        }
    }

    pub fn streamed(mut self) -> Self {
        self.streamed = true;
        self
    }
}

/// Structured success payload returned by the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Command the result belongs to
    pub statement_text: String,
    /// Engine-defined payload
    pub payload:        serde_json::Value,
}

impl CommandResult {
    pub fn new(statement_text: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            statement_text: statement_text.into(),
            payload,
        }
    }
}

/// Health check body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub is_healthy: bool,
}

/// Server information body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub version:              String,
    pub client_auth_required: bool,
}
