#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use comfyrun_api::config::AppConfig;
use comfyrun_api::router::build_app_router;
use comfyrun_api::state::AppState;
use comfyrun_cloud::client::RunPodClient;
use comfyrun_cloud::config::RunPodConfig;
use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_worker::supervisor::{Supervisor, SupervisorConfig};
use http_body_util::BodyExt;
use tower::ServiceExt;

/// Directory layout of one test worker, all under a temp dir.
pub struct TestDirs {
    pub root: tempfile::TempDir,
}

impl TestDirs {
    pub fn new() -> Self {
        let dirs = Self {
            root: tempfile::tempdir().unwrap(),
        };
        std::fs::create_dir_all(dirs.input()).unwrap();
        std::fs::create_dir_all(dirs.output()).unwrap();
        std::fs::create_dir_all(dirs.models().join("checkpoints")).unwrap();
        std::fs::create_dir_all(dirs.models().join("loras")).unwrap();
        dirs
    }

    pub fn input(&self) -> PathBuf {
        self.root.path().join("input")
    }

    pub fn output(&self) -> PathBuf {
        self.root.path().join("output")
    }

    pub fn models(&self) -> PathBuf {
        self.root.path().join("models")
    }
}

/// Build a test [`AppConfig`] rooted at `dirs`, engine expected at
/// `127.0.0.1:<comfyui_port>`, polling every second.
pub fn test_config(dirs: &TestDirs, comfyui_port: u16) -> AppConfig {
    let vars: HashMap<&str, String> = HashMap::from([
        ("HOST", "127.0.0.1".to_string()),
        ("PORT", "0".to_string()),
        ("COMFYUI_HOST", "127.0.0.1".to_string()),
        ("COMFYUI_PORT", comfyui_port.to_string()),
        ("COMFYUI_INPUT", dirs.input().display().to_string()),
        ("COMFYUI_OUTPUT", dirs.output().display().to_string()),
        ("MODELS_PATH", dirs.models().display().to_string()),
        ("POLL_INTERVAL", "1".to_string()),
        ("REQUEST_TIMEOUT_SECS", "60".to_string()),
    ]);
    AppConfig::from_lookup(|name| vars.get(name).cloned())
}

/// State whose supervisor runs a long `sleep` in place of the engine and
/// probes `comfyui_url` for readiness.
pub fn test_state(config: AppConfig, comfyui_url: &str, runpod: Option<RunPodConfig>) -> AppState {
    let comfyui = ComfyUIApi::new(comfyui_url.to_string());
    let supervisor = Supervisor::new(
        SupervisorConfig {
            probe_interval: Duration::from_millis(50),
            readiness_timeout: Duration::from_secs(5),
            ..SupervisorConfig::command("sh", vec!["-c".into(), "sleep 30".into()])
        },
        Arc::new(comfyui.clone()),
    );
    AppState {
        config: Arc::new(config),
        supervisor,
        comfyui,
        runpod: runpod.as_ref().map(RunPodClient::new),
    }
}

/// Build the full application router with all middleware layers.
///
/// Uses [`build_app_router`] so integration tests exercise the same
/// middleware stack (request ID, timeout, tracing, panic recovery) that
/// production uses.
pub fn build_test_app(state: AppState) -> Router {
    let server = state.config.server.clone();
    build_app_router(state, &server)
}

/// Send a GET request to the given URI and return the response.
pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Send a POST request with a JSON body.
pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Write `bytes` to `dir/name`, creating parents.
pub fn write_file(dir: &Path, name: &str, bytes: &[u8]) {
    let path = dir.join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
}
