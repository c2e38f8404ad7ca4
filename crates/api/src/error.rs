use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use comfyrun_core::error::CoreError;
use comfyrun_worker::supervisor::Supervisor;
use serde::Serialize;

/// Number of engine log lines attached to error responses.
pub const DIAGNOSTIC_LOG_LINES: usize = 20;

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `comfyrun_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// HTTP status, stable code and client-facing message.
    fn classify(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Core(core) => {
                let status = match core {
                    CoreError::Validation(_) => StatusCode::BAD_REQUEST,
                    CoreError::Configuration(_) | CoreError::EngineUnresponsive(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    CoreError::Submission(_) | CoreError::Transport { .. } => StatusCode::BAD_GATEWAY,
                    CoreError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                    CoreError::ExecutionFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    CoreError::Internal(msg) => {
                        tracing::error!(error = %msg, "Internal core error");
                        return (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            core.code(),
                            "An internal error occurred".to_string(),
                        );
                    }
                };
                (status, core.code(), core.to_string())
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
        }
    }

    /// Structured details for the `diagnostic_info` field.
    fn diagnostic_info(&self) -> Option<serde_json::Value> {
        match self {
            AppError::Core(CoreError::Validation(errors)) => {
                Some(serde_json::json!({ "validation_errors": errors }))
            }
            AppError::Core(CoreError::Timeout { secs }) => {
                Some(serde_json::json!({ "timeout_secs": secs }))
            }
            _ => None,
        }
    }
}

/// Engine state captured when an error response is built.
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub comfyui_running: bool,
    pub comfyui_responsive: bool,
    pub recent_logs: Vec<String>,
}

impl SystemState {
    pub async fn capture(supervisor: &Supervisor) -> Self {
        Self {
            comfyui_running: supervisor.is_process_alive().await,
            comfyui_responsive: supervisor.is_responsive().await,
            recent_logs: supervisor.recent_logs(DIAGNOSTIC_LOG_LINES),
        }
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub status: &'static str,
    pub error: String,
    pub code: &'static str,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic_info: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_state: Option<SystemState>,
}

/// An [`AppError`] plus, for job endpoints, the engine state at the time.
#[derive(Debug)]
pub struct ErrorReport {
    pub error: AppError,
    pub system_state: Option<SystemState>,
}

impl ErrorReport {
    pub fn new(error: impl Into<AppError>) -> Self {
        Self {
            error: error.into(),
            system_state: None,
        }
    }

    /// Attach a [`SystemState`] snapshot of `supervisor`.
    pub async fn with_system_state(mut self, supervisor: &Supervisor) -> Self {
        self.system_state = Some(SystemState::capture(supervisor).await);
        self
    }
}

impl From<AppError> for ErrorReport {
    fn from(error: AppError) -> Self {
        Self::new(error)
    }
}

impl IntoResponse for ErrorReport {
    fn into_response(self) -> Response {
        let (status, code, message) = self.error.classify();

        let body = ErrorBody {
            status: "error",
            error: message,
            code,
            timestamp: Utc::now().to_rfc3339(),
            diagnostic_info: self.error.diagnostic_info(),
            system_state: self.system_state,
        };

        (status, axum::Json(body)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        ErrorReport::new(self).into_response()
    }
}
