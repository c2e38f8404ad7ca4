/// Domain error taxonomy for workflow execution.
///
/// Every variant maps to a stable machine-readable [`code`](Self::code)
/// so the HTTP boundary can report the error kind without matching on
/// message text.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Missing or invalid configuration (credentials, endpoints).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The transport rejected the job at submission time.
    #[error("Submission failed: {0}")]
    Submission(String),

    /// The engine stopped answering health checks while a job was polled.
    #[error("Engine unresponsive: {0}")]
    EngineUnresponsive(String),

    /// The transport reported a terminal failure for the job.
    #[error("Workflow execution failed: {0}")]
    ExecutionFailed(String),

    /// No terminal status arrived within the execution budget.
    #[error("Workflow execution timeout after {secs}s")]
    Timeout { secs: u64 },

    /// One or more graph validation violations. All are reported together.
    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A request to the engine or queue failed below the protocol level.
    #[error("Transport error: {message}")]
    Transport { message: String, retryable: bool },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Convenience constructor for a single validation message.
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(vec![msg.into()])
    }

    /// Stable error code used in structured error responses.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Configuration(_) => "CONFIGURATION_ERROR",
            CoreError::Submission(_) => "SUBMISSION_ERROR",
            CoreError::EngineUnresponsive(_) => "ENGINE_UNRESPONSIVE",
            CoreError::ExecutionFailed(_) => "EXECUTION_FAILURE",
            CoreError::Timeout { .. } => "TIMEOUT",
            CoreError::Validation(_) => "VALIDATION_ERROR",
            CoreError::Transport { .. } => "TRANSPORT_ERROR",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether a poll loop may keep going after this error.
    ///
    /// Only transport errors flagged retryable qualify. Everything else
    /// ends the job.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transport { retryable: true, .. })
    }
}
