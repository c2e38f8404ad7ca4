//! Service configuration loaded from environment variables.
//!
//! Every value has a default suited to the RunPod worker image. Values
//! that fail to parse fall back to the default, and values below their
//! minimum are raised to it. Both cases log a warning.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use comfyrun_cloud::config::RunPodConfig;
use comfyrun_core::validation::ValidationRoots;
use comfyrun_pipeline::executor::ExecutionPolicy;
use comfyrun_worker::supervisor::{ComfyUILaunch, SupervisorConfig};

/// Lowest accepted `EXECUTION_TIMEOUT`.
pub const MIN_EXECUTION_TIMEOUT_SECS: u64 = 30;

/// Lowest accepted `HEALTH_CHECK_TIMEOUT`.
pub const MIN_HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `8000`).
    pub port: u16,
    /// Whole-request timeout in seconds (default: `900`). Must exceed the
    /// execution timeout or long jobs are cut off by the HTTP layer.
    pub request_timeout_secs: u64,
}

/// Job handling settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub execution_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    /// Readiness window for a freshly started engine.
    pub health_check_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Output files older than this are swept.
    pub cleanup_age_secs: u64,
    /// Default for requests that do not say.
    pub return_base64: bool,
    pub log_comfyui_output: bool,
    pub comfyui_host: String,
    pub comfyui_port: u16,
}

/// Filesystem layout of the ComfyUI install.
#[derive(Debug, Clone)]
pub struct PathConfig {
    pub comfyui_path: PathBuf,
    pub comfyui_python: PathBuf,
    pub comfyui_input: PathBuf,
    pub comfyui_output: PathBuf,
    pub models_path: PathBuf,
    pub model_paths_config: PathBuf,
}

/// Everything the service reads from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub handler: HandlerConfig,
    pub paths: PathConfig,
    /// Present only when both RunPod credentials are set.
    pub runpod: Option<RunPodConfig>,
}

impl AppConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                 | Default                          |
    /// |-------------------------|----------------------------------|
    /// | `HOST`                  | `0.0.0.0`                        |
    /// | `PORT`                  | `8000`                           |
    /// | `REQUEST_TIMEOUT_SECS`  | `900`                            |
    /// | `EXECUTION_TIMEOUT`     | `300` (min 30)                   |
    /// | `HEALTH_CHECK_INTERVAL` | `5`                              |
    /// | `HEALTH_CHECK_TIMEOUT`  | `30` (min 5)                     |
    /// | `POLL_INTERVAL`         | `2`                              |
    /// | `CLEANUP_AGE`           | `3600`                           |
    /// | `RETURN_BASE64`         | `true`                           |
    /// | `LOG_COMFYUI_OUTPUT`    | `true`                           |
    /// | `COMFYUI_HOST`          | `0.0.0.0`                        |
    /// | `COMFYUI_PORT`          | `8188`                           |
    /// | `COMFYUI_PATH`          | `/comfyui`                       |
    /// | `COMFYUI_PYTHON`        | `/comfyui/.venv/bin/python`      |
    /// | `COMFYUI_INPUT`         | `/comfyui/input`                 |
    /// | `COMFYUI_OUTPUT`        | `/comfyui/output`                |
    /// | `MODELS_PATH`           | `/runpod-volume/comfyui/models`  |
    /// | `MODEL_PATHS_CONFIG`    | `/model_paths.yaml`              |
    ///
    /// RunPod credentials are read by [`RunPodConfig::from_env`].
    pub fn from_env() -> Self {
        let mut config = Self::from_lookup(|name| std::env::var(name).ok());
        config.runpod = RunPodConfig::from_env();
        config
    }

    /// Build from an arbitrary variable source. RunPod settings are left
    /// unset.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(get);

        let server = ServerConfig {
            host: env.string("HOST", "0.0.0.0"),
            port: env.parse("PORT", 8000),
            request_timeout_secs: env.parse("REQUEST_TIMEOUT_SECS", 900),
        };

        let handler = HandlerConfig {
            execution_timeout_secs: env.at_least(
                "EXECUTION_TIMEOUT",
                300,
                MIN_EXECUTION_TIMEOUT_SECS,
            ),
            health_check_interval_secs: env.at_least("HEALTH_CHECK_INTERVAL", 5, 1),
            health_check_timeout_secs: env.at_least(
                "HEALTH_CHECK_TIMEOUT",
                30,
                MIN_HEALTH_CHECK_TIMEOUT_SECS,
            ),
            poll_interval_secs: env.at_least("POLL_INTERVAL", 2, 1),
            cleanup_age_secs: env.parse("CLEANUP_AGE", 3600),
            return_base64: env.flag("RETURN_BASE64", true),
            log_comfyui_output: env.flag("LOG_COMFYUI_OUTPUT", true),
            comfyui_host: env.string("COMFYUI_HOST", "0.0.0.0"),
            comfyui_port: env.parse("COMFYUI_PORT", 8188),
        };

        let paths = PathConfig {
            comfyui_path: env.string("COMFYUI_PATH", "/comfyui").into(),
            comfyui_python: env.string("COMFYUI_PYTHON", "/comfyui/.venv/bin/python").into(),
            comfyui_input: env.string("COMFYUI_INPUT", "/comfyui/input").into(),
            comfyui_output: env.string("COMFYUI_OUTPUT", "/comfyui/output").into(),
            models_path: env.string("MODELS_PATH", "/runpod-volume/comfyui/models").into(),
            model_paths_config: env.string("MODEL_PATHS_CONFIG", "/model_paths.yaml").into(),
        };

        Self {
            server,
            handler,
            paths,
            runpod: None,
        }
    }

    /// Base URL the service uses to reach the engine. A wildcard listen
    /// address is reached over loopback.
    pub fn comfyui_url(&self) -> String {
        let host = match self.handler.comfyui_host.as_str() {
            "0.0.0.0" | "::" | "" => "127.0.0.1",
            other => other,
        };
        format!("http://{host}:{}", self.handler.comfyui_port)
    }

    pub fn execution_policy(&self) -> ExecutionPolicy {
        ExecutionPolicy {
            timeout: Duration::from_secs(self.handler.execution_timeout_secs),
            poll_interval: Duration::from_secs(self.handler.poll_interval_secs),
            health_check_interval: Duration::from_secs(self.handler.health_check_interval_secs),
        }
    }

    pub fn comfyui_launch(&self) -> ComfyUILaunch {
        ComfyUILaunch {
            python: self.paths.comfyui_python.clone(),
            install_dir: self.paths.comfyui_path.clone(),
            host: self.handler.comfyui_host.clone(),
            port: self.handler.comfyui_port,
            input_dir: self.paths.comfyui_input.clone(),
            output_dir: self.paths.comfyui_output.clone(),
            model_paths_config: self.paths.model_paths_config.clone(),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            readiness_timeout: Duration::from_secs(self.handler.health_check_timeout_secs),
            log_output: self.handler.log_comfyui_output,
            ..SupervisorConfig::comfyui(&self.comfyui_launch())
        }
    }

    pub fn validation_roots(&self) -> ValidationRoots {
        ValidationRoots {
            models_dir: self.paths.models_path.clone(),
            input_dir: self.paths.comfyui_input.clone(),
        }
    }

    /// Non-fatal problems worth logging at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.runpod.is_none() {
            warnings.push("RUNPOD_API_KEY / RUNPOD_ENDPOINT_ID not set; /remote/run disabled".into());
        }
        if !self.paths.comfyui_path.join("main.py").exists() {
            warnings.push(format!(
                "ComfyUI not found at {}",
                self.paths.comfyui_path.display()
            ));
        }
        if !self.paths.models_path.exists() {
            warnings.push(format!(
                "Models path {} does not exist",
                self.paths.models_path.display()
            ));
        }
        if self.server.request_timeout_secs <= self.handler.execution_timeout_secs {
            warnings.push(format!(
                "REQUEST_TIMEOUT_SECS ({}) does not exceed EXECUTION_TIMEOUT ({})",
                self.server.request_timeout_secs, self.handler.execution_timeout_secs
            ));
        }
        warnings
    }
}

/// Typed access to a variable source.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Display,
    {
        let Some(raw) = self.raw(name) else {
            return default;
        };
        match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, default = %default, "Unparsable setting, using default");
                default
            }
        }
    }

    fn at_least(&self, name: &str, default: u64, min: u64) -> u64 {
        let value = self.parse(name, default);
        if value < min {
            tracing::warn!(var = name, value, min, "Setting below minimum, clamping");
            return min;
        }
        value
    }

    fn flag(&self, name: &str, default: bool) -> bool {
        let Some(raw) = self.raw(name) else {
            return default;
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                tracing::warn!(var = name, value = %raw, default, "Unparsable flag, using default");
                default
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> AppConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let c = config(&[]);
        assert_eq!(c.server.port, 8000);
        assert_eq!(c.handler.execution_timeout_secs, 300);
        assert_eq!(c.handler.health_check_timeout_secs, 30);
        assert_eq!(c.handler.poll_interval_secs, 2);
        assert_eq!(c.handler.cleanup_age_secs, 3600);
        assert!(c.handler.return_base64);
        assert_eq!(c.paths.comfyui_output, PathBuf::from("/comfyui/output"));
        assert_eq!(c.comfyui_url(), "http://127.0.0.1:8188");
        assert!(c.runpod.is_none());
    }

    #[test]
    fn minimums_are_enforced() {
        let c = config(&[("EXECUTION_TIMEOUT", "10"), ("HEALTH_CHECK_TIMEOUT", "1")]);
        assert_eq!(c.handler.execution_timeout_secs, MIN_EXECUTION_TIMEOUT_SECS);
        assert_eq!(c.handler.health_check_timeout_secs, MIN_HEALTH_CHECK_TIMEOUT_SECS);
    }

    #[test]
    fn unparsable_values_fall_back() {
        let c = config(&[("PORT", "eighty"), ("RETURN_BASE64", "maybe"), ("POLL_INTERVAL", "-1")]);
        assert_eq!(c.server.port, 8000);
        assert!(c.handler.return_base64);
        assert_eq!(c.handler.poll_interval_secs, 2);
    }

    #[test]
    fn overrides_flow_into_derived_settings() {
        let c = config(&[
            ("EXECUTION_TIMEOUT", "120"),
            ("POLL_INTERVAL", "1"),
            ("HEALTH_CHECK_TIMEOUT", "45"),
            ("RETURN_BASE64", "false"),
            ("COMFYUI_HOST", "10.0.0.5"),
            ("COMFYUI_PORT", "9000"),
            ("MODELS_PATH", "/models"),
        ]);

        let policy = c.execution_policy();
        assert_eq!(policy.timeout, Duration::from_secs(120));
        assert_eq!(policy.poll_interval, Duration::from_secs(1));
        assert!(!c.handler.return_base64);
        assert_eq!(c.comfyui_url(), "http://10.0.0.5:9000");
        assert_eq!(c.supervisor_config().readiness_timeout, Duration::from_secs(45));
        assert_eq!(c.validation_roots().models_dir, PathBuf::from("/models"));
    }
}
