use std::sync::Arc;

use comfyrun_cloud::client::RunPodClient;
use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_worker::supervisor::{Supervisor, SupervisorHandle};

use crate::config::AppConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    /// Owner of the local ComfyUI process.
    pub supervisor: SupervisorHandle,
    /// HTTP client for the local engine.
    pub comfyui: ComfyUIApi,
    /// RunPod queue client, when credentials are configured.
    pub runpod: Option<RunPodClient>,
}

impl AppState {
    /// Wire up state from configuration. The engine is not started here.
    pub fn from_config(config: AppConfig) -> Self {
        let comfyui = ComfyUIApi::new(config.comfyui_url());
        let supervisor = Supervisor::new(config.supervisor_config(), Arc::new(comfyui.clone()));
        let runpod = config.runpod.as_ref().map(RunPodClient::new);
        Self {
            config: Arc::new(config),
            supervisor,
            comfyui,
            runpod,
        }
    }
}
