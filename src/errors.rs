use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for the gateway core
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    // Caller input
    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("No configuration registered for caller '{caller_id}'")]
    UnknownCaller { caller_id: String },

    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    // Backend authentication
    #[error("Authentication against '{target}' failed: {reason}")]
    Authentication { target: String, reason: String },

    /// Raised when the backend rejects the current session id. Absorbed by the
    /// single re-login retry in `BackendSession::call` and never returned to callers.
    #[error("Session on '{target}' is no longer valid")]
    SessionExpired { target: String, message: String },

    // Backend calls
    #[error("Backend call '{command}' failed with HTTP {status}: {body}")]
    Backend {
        command: String,
        status: u16,
        body: String,
    },

    #[error("Could not reach '{target}': {reason}")]
    Transport { target: String, reason: String },

    #[error("Unexpected response to '{command}': {reason}")]
    MalformedResponse { command: String, reason: String },

    // Remote tasks
    #[error("Script submission to '{target}' failed: {reason}")]
    TaskSubmission { target: String, reason: String },

    #[error("Task '{task_id}' did not complete after {attempts} polls")]
    TaskTimeout { task_id: String, attempts: u32 },

    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

impl GatewayError {
    /// Stable machine-readable name used in structured results
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Configuration { .. } => "configuration",
            GatewayError::UnknownCaller { .. } => "unknown_caller",
            GatewayError::InvalidRequest { .. } => "invalid_request",
            GatewayError::Authentication { .. } => "authentication",
            GatewayError::SessionExpired { .. } => "session_expired",
            GatewayError::Backend { .. } => "backend",
            GatewayError::Transport { .. } => "transport",
            GatewayError::MalformedResponse { .. } => "malformed_response",
            GatewayError::TaskSubmission { .. } => "task_submission",
            GatewayError::TaskTimeout { .. } => "task_timeout",
            GatewayError::Internal { .. } => "internal",
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        GatewayError::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        GatewayError::Internal {
            reason: reason.into(),
        }
    }
}

/// Error severity levels for categorization and logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Informational, the caller can simply ask again later
    Info,
    /// The request failed but the caller's connection is intact
    Warning,
    /// The caller must fix its input before retrying
    Error,
    /// Gateway invariant broken
    Critical,
}

/// Error plus the metadata needed to report it at a request boundary
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error: GatewayError,
    pub severity: ErrorSeverity,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context_data: std::collections::HashMap<String, String>,
    pub correlation_id: String,
}

impl ErrorContext {
    pub fn new(error: GatewayError) -> Self {
        let severity = Self::determine_severity(&error);

        Self {
            error,
            severity,
            timestamp: chrono::Utc::now(),
            context_data: std::collections::HashMap::new(),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_context(mut self, key: &str, value: &str) -> Self {
        self.context_data.insert(key.to_string(), value.to_string());
        self
    }

    fn determine_severity(error: &GatewayError) -> ErrorSeverity {
        match error {
            GatewayError::TaskTimeout { .. } => ErrorSeverity::Info,
            GatewayError::Configuration { .. }
            | GatewayError::UnknownCaller { .. }
            | GatewayError::InvalidRequest { .. }
            | GatewayError::Authentication { .. } => ErrorSeverity::Error,
            GatewayError::Internal { .. } => ErrorSeverity::Critical,
            _ => ErrorSeverity::Warning,
        }
    }

    /// Message safe to hand back to the caller
    pub fn user_message(&self) -> String {
        match &self.error {
            GatewayError::Configuration { reason } => {
                format!("Configuration issue: {reason}. Fix the connection settings and retry.")
            }

            GatewayError::UnknownCaller { caller_id } => {
                format!("Session '{caller_id}' has no connection settings. Send credentials and a target with the request.")
            }

            GatewayError::Authentication { target, reason } => {
                format!("Login to '{target}' was rejected: {reason}. Check the credentials configured for this target.")
            }

            GatewayError::TaskTimeout { task_id, .. } => {
                format!("Task '{task_id}' is still processing. Try again later with this task id.")
            }

            GatewayError::Transport { target, .. } => {
                format!("Management server '{target}' could not be reached. Check the host and port.")
            }

            _ => self.error.to_string(),
        }
    }

    /// Generate technical error message for logs
    pub fn technical_message(&self) -> String {
        format!(
            "[{}] {} | Severity: {:?} | Correlation: {} | Context: {:?}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.error,
            self.severity,
            self.correlation_id,
            self.context_data
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
