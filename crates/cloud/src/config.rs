use comfyrun_core::error::CoreError;

/// Default RunPod v2 API base URL.
pub const DEFAULT_API_BASE: &str = "https://api.runpod.ai/v2";

/// Credentials and endpoint for the RunPod queue.
///
/// | Env var              | Default                    |
/// |----------------------|----------------------------|
/// | `RUNPOD_API_KEY`     | (required)                 |
/// | `RUNPOD_ENDPOINT_ID` | (required)                 |
/// | `RUNPOD_API_BASE`    | `https://api.runpod.ai/v2` |
#[derive(Debug, Clone)]
pub struct RunPodConfig {
    pub api_key: String,
    pub endpoint_id: String,
    pub api_base: String,
}

impl RunPodConfig {
    /// Load from the environment. Returns `None` when either the key or
    /// the endpoint id is unset, so the service can start without remote
    /// support.
    pub fn from_env() -> Option<Self> {
        let api_key = non_empty_var("RUNPOD_API_KEY")?;
        let endpoint_id = non_empty_var("RUNPOD_ENDPOINT_ID")?;
        let api_base =
            non_empty_var("RUNPOD_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Some(Self {
            api_key,
            endpoint_id,
            api_base,
        })
    }

    /// Like [`from_env`](Self::from_env) but fails with a configuration
    /// error naming what is missing.
    pub fn require() -> Result<Self, CoreError> {
        Self::from_env().ok_or_else(|| {
            CoreError::Configuration(
                "RUNPOD_API_KEY and RUNPOD_ENDPOINT_ID must both be set for remote execution"
                    .into(),
            )
        })
    }

    /// `{api_base}/{endpoint_id}` with no trailing slash.
    pub fn endpoint_url(&self) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            self.endpoint_id
        )
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
