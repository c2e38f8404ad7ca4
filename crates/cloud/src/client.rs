//! HTTP client for the RunPod serverless v2 API.
//!
//! Only the two queue endpoints the worker needs are wrapped:
//! `POST /{endpoint}/run` and `GET /{endpoint}/status/{id}`.

use std::collections::BTreeMap;
use std::time::Duration;

use comfyrun_core::error::CoreError;
use serde::{Deserialize, Serialize};

use crate::config::RunPodConfig;

/// Timeout for a single queue request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// `input` object of a run request, as read by the worker handler.
#[derive(Debug, Clone, Serialize)]
pub struct RunInput<'a> {
    pub workflow: &'a serde_json::Value,
    /// Relative path -> base64 image, written into the engine's input
    /// directory before execution.
    pub reference_images: &'a BTreeMap<String, String>,
    pub return_base64: bool,
}

#[derive(Debug, Serialize)]
struct RunRequest<'a> {
    input: RunInput<'a>,
}

/// Response to `POST /run`.
#[derive(Debug, Deserialize)]
pub struct RunResponse {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Response to `GET /status/{id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// Errors from the RunPod API layer.
#[derive(Debug, thiserror::Error)]
pub enum RunPodError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("RunPod API error ({status}): {body}")]
    ApiError { status: u16, body: String },
}

impl RunPodError {
    /// Timeouts, connection failures, rate limiting and 5xx responses may
    /// succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunPodError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            RunPodError::ApiError { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

impl From<RunPodError> for CoreError {
    fn from(err: RunPodError) -> Self {
        CoreError::Transport {
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// Client bound to one serverless endpoint.
#[derive(Debug, Clone)]
pub struct RunPodClient {
    client: reqwest::Client,
    api_key: String,
    endpoint_url: String,
}

impl RunPodClient {
    pub fn new(config: &RunPodConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            endpoint_url: config.endpoint_url(),
        }
    }

    /// `{api_base}/{endpoint_id}`.
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// Queue a job. Returns RunPod's job id.
    pub async fn run(&self, input: RunInput<'_>) -> Result<RunResponse, RunPodError> {
        let response = self
            .client
            .post(format!("{}/run", self.endpoint_url))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&RunRequest { input })
            .send()
            .await?;

        Self::parse_response(response).await
    }

    /// Fetch the current status (and output, once completed) of a job.
    pub async fn status(&self, job_id: &str) -> Result<StatusResponse, RunPodError> {
        let response = self
            .client
            .get(format!("{}/status/{}", self.endpoint_url, job_id))
            .bearer_auth(&self.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    // ---- private helpers ----

    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, RunPodError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(RunPodError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RunPodError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
