//! Engine process supervisor.
//!
//! Lifecycle:
//!
//! ```text
//! Stopped --start--> Starting --probe ok--> Ready
//!                       |                     |
//!            timeout / early exit     exit / probe failure
//!                       v                     v
//!                    Crashed <----------------+
//! ```
//!
//! Only the check-and-spawn step runs under the process mutex. Readiness
//! probes and the sleeps between them run without it, so concurrent
//! callers that find the supervisor in `Starting` wait on a
//! [`watch`] channel for the outcome instead of spawning a second engine.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use comfyrun_core::error::CoreError;
use comfyrun_core::job::HealthProbe;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::logs::{LogBuffer, DEFAULT_LOG_CAPACITY};

/// Interval between readiness probes while starting.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// How long a freshly spawned engine has to answer its first probe.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared handle stored in application state.
pub type SupervisorHandle = Arc<Supervisor>;

/// Lifecycle state of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Ready,
    Crashed,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorState::Stopped => "stopped",
            SupervisorState::Starting => "starting",
            SupervisorState::Ready => "ready",
            SupervisorState::Crashed => "crashed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to spawn engine process: {0}")]
    Spawn(std::io::Error),

    #[error("Engine exited during startup ({status})")]
    ExitedDuringStartup { status: ExitStatus },

    #[error("Engine did not become ready within {secs}s")]
    ReadinessTimeout { secs: u64 },

    /// The process was stopped or replaced while this start was waiting.
    #[error("Engine start interrupted")]
    Interrupted,
}

impl From<SupervisorError> for CoreError {
    fn from(err: SupervisorError) -> Self {
        CoreError::EngineUnresponsive(err.to_string())
    }
}

/// Command line of a ComfyUI install.
#[derive(Debug, Clone)]
pub struct ComfyUILaunch {
    /// Interpreter inside the install's virtualenv.
    pub python: PathBuf,
    /// Directory containing `main.py`.
    pub install_dir: PathBuf,
    pub host: String,
    pub port: u16,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub model_paths_config: PathBuf,
}

impl ComfyUILaunch {
    /// Arguments passed to the interpreter.
    pub fn args(&self) -> Vec<String> {
        vec![
            "main.py".to_string(),
            "--listen".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--input-directory".to_string(),
            self.input_dir.display().to_string(),
            "--output-directory".to_string(),
            self.output_dir.display().to_string(),
            "--extra-model-paths-config".to_string(),
            self.model_paths_config.display().to_string(),
        ]
    }
}

/// What to run and how patiently to wait for it.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Created (if missing) before every spawn.
    pub ensure_dirs: Vec<PathBuf>,
    pub probe_interval: Duration,
    pub readiness_timeout: Duration,
    pub log_capacity: usize,
    /// Re-log every captured line under the `comfyui` target.
    pub log_output: bool,
}

impl SupervisorConfig {
    /// Arbitrary command with default timings.
    pub fn command(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            ensure_dirs: Vec::new(),
            probe_interval: DEFAULT_PROBE_INTERVAL,
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            log_capacity: DEFAULT_LOG_CAPACITY,
            log_output: true,
        }
    }

    /// `<python> main.py ...` run from the install directory, with the
    /// input and output directories created on each start.
    pub fn comfyui(launch: &ComfyUILaunch) -> Self {
        Self {
            working_dir: Some(launch.install_dir.clone()),
            ensure_dirs: vec![launch.input_dir.clone(), launch.output_dir.clone()],
            ..Self::command(launch.python.clone(), launch.args())
        }
    }
}

/// The one process a supervisor owns.
struct SupervisedProcess {
    child: Option<Child>,
    /// Incremented on every spawn.
    generation: u64,
    restarts: u32,
    last_health_check: Option<Instant>,
}

/// Owns the engine process for the lifetime of the service.
pub struct Supervisor {
    config: SupervisorConfig,
    probe: Arc<dyn HealthProbe>,
    logs: LogBuffer,
    process: Mutex<SupervisedProcess>,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    /// Create a stopped supervisor. Nothing is spawned until
    /// [`start`](Self::start) or [`ensure_running`](Self::ensure_running).
    pub fn new(config: SupervisorConfig, probe: Arc<dyn HealthProbe>) -> SupervisorHandle {
        let (state, _) = watch::channel(SupervisorState::Stopped);
        Arc::new(Self {
            logs: LogBuffer::new(config.log_capacity),
            config,
            probe,
            process: Mutex::new(SupervisedProcess {
                child: None,
                generation: 0,
                restarts: 0,
                last_health_check: None,
            }),
            state,
        })
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Spawn the engine (replacing any existing process) and wait until
    /// it answers the probe.
    ///
    /// On readiness timeout or early exit the process is killed, the
    /// supervisor moves to `Crashed` and the error is returned.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let generation = {
            let mut process = self.process.lock().await;
            self.spawn_locked(&mut process).await?
        };
        self.await_ready(generation).await
    }

    /// Make sure the engine is up, restarting it once if needed.
    ///
    /// * `Stopped` / `Crashed`: start.
    /// * `Starting`: wait for the in-flight start.
    /// * `Ready`: if the process exited, or the probe fails, kill it and
    ///   start again. No backoff.
    ///
    /// Returns whether the engine is ready afterwards.
    pub async fn ensure_running(&self) -> bool {
        let mut process = self.process.lock().await;

        if self.state() == SupervisorState::Starting {
            drop(process);
            return self.wait_for_start().await;
        }

        if self.state() == SupervisorState::Ready {
            if let Some(status) = reap_exited(&mut process) {
                process.restarts += 1;
                self.state.send_replace(SupervisorState::Crashed);
                tracing::warn!(
                    exit = %status,
                    restarts = process.restarts,
                    "Engine process exited, restarting",
                );
            } else {
                let generation = process.generation;
                drop(process);

                if self.probe.is_healthy().await {
                    self.process.lock().await.last_health_check = Some(Instant::now());
                    return true;
                }

                process = self.process.lock().await;
                match self.state() {
                    SupervisorState::Ready if process.generation == generation => {
                        if let Some(mut child) = process.child.take() {
                            kill_child(&mut child).await;
                        }
                        process.restarts += 1;
                        self.state.send_replace(SupervisorState::Crashed);
                        tracing::warn!(
                            restarts = process.restarts,
                            "Engine stopped answering its probe, restarting",
                        );
                    }
                    // Another caller already restarted it.
                    SupervisorState::Ready => return true,
                    SupervisorState::Starting => {
                        drop(process);
                        return self.wait_for_start().await;
                    }
                    SupervisorState::Stopped | SupervisorState::Crashed => {}
                }
            }
        }

        let generation = match self.spawn_locked(&mut process).await {
            Ok(generation) => generation,
            Err(e) => {
                tracing::error!(error = %e, "Failed to start engine");
                return false;
            }
        };
        drop(process);

        match self.await_ready(generation).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "Engine failed to become ready");
                false
            }
        }
    }

    /// Kill the process (if any) and move to `Stopped`.
    pub async fn shutdown(&self) {
        let mut process = self.process.lock().await;
        if let Some(mut child) = process.child.take() {
            kill_child(&mut child).await;
            tracing::info!("Engine process stopped");
        }
        self.state.send_replace(SupervisorState::Stopped);
    }

    /// Last `n` captured output lines. Does not drain the buffer.
    pub fn recent_logs(&self, n: usize) -> Vec<String> {
        self.logs.recent(n)
    }

    /// Whether the child exists and has not exited. Never waits on the
    /// child itself.
    pub async fn is_process_alive(&self) -> bool {
        let mut process = self.process.lock().await;
        match process.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Probe the engine directly, regardless of supervisor state.
    pub async fn is_responsive(&self) -> bool {
        self.probe.is_healthy().await
    }

    /// Number of crash or unresponsiveness restarts so far.
    pub async fn restart_count(&self) -> u32 {
        self.process.lock().await.restarts
    }

    /// Number of processes spawned so far.
    pub async fn generation(&self) -> u64 {
        self.process.lock().await.generation
    }

    pub async fn last_health_check(&self) -> Option<Instant> {
        self.process.lock().await.last_health_check
    }

    // ---- private helpers ----

    /// Spawn a new process while holding the process mutex.
    async fn spawn_locked(&self, process: &mut SupervisedProcess) -> Result<u64, SupervisorError> {
        if let Some(mut old) = process.child.take() {
            kill_child(&mut old).await;
        }

        let child = match self.spawn_child().await {
            Ok(child) => child,
            Err(e) => {
                self.state.send_replace(SupervisorState::Crashed);
                return Err(e);
            }
        };

        process.generation += 1;
        tracing::info!(
            pid = child.id(),
            generation = process.generation,
            program = %self.config.program.display(),
            "Engine process spawned",
        );
        process.child = Some(child);
        self.state.send_replace(SupervisorState::Starting);
        Ok(process.generation)
    }

    async fn spawn_child(&self) -> Result<Child, SupervisorError> {
        for dir in &self.config.ensure_dirs {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| SupervisorError::CreateDir {
                    path: dir.clone(),
                    source,
                })?;
        }

        let mut cmd = Command::new(&self.config.program);
        cmd.args(&self.config.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(stderr, "stderr");
        }
        Ok(child)
    }

    /// Forward one output stream into the log buffer, line by line.
    ///
    /// Lines are split on raw bytes and decoded lossily, so output that is
    /// not valid UTF-8 never stops the pipe from being drained.
    fn spawn_reader<R>(&self, stream: R, name: &'static str)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let logs = self.logs.clone();
        let echo = self.config.log_output;
        tokio::spawn(async move {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']);
                        if echo {
                            tracing::info!(target: "comfyui", stream = name, "{line}");
                        }
                        logs.push(line);
                    }
                    Err(e) => {
                        tracing::debug!(stream = name, error = %e, "Engine output reader stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Probe until ready, the process exits, or the readiness window
    /// closes. Runs without holding the process mutex between steps.
    async fn await_ready(&self, generation: u64) -> Result<(), SupervisorError> {
        let mut guard = StartingGuard::new(&self.state);
        let deadline = Instant::now() + self.config.readiness_timeout;

        loop {
            {
                let mut process = self.process.lock().await;
                if process.generation != generation || process.child.is_none() {
                    guard.disarm();
                    return Err(SupervisorError::Interrupted);
                }
                if let Some(status) = reap_exited(&mut process) {
                    self.state.send_replace(SupervisorState::Crashed);
                    guard.disarm();
                    tracing::error!(exit = %status, "Engine exited during startup");
                    return Err(SupervisorError::ExitedDuringStartup { status });
                }
            }

            if self.probe.is_healthy().await {
                let mut process = self.process.lock().await;
                guard.disarm();
                if process.generation != generation {
                    return Err(SupervisorError::Interrupted);
                }
                process.last_health_check = Some(Instant::now());
                self.state.send_replace(SupervisorState::Ready);
                tracing::info!(generation, "Engine is ready");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                let mut process = self.process.lock().await;
                guard.disarm();
                if process.generation == generation {
                    if let Some(mut child) = process.child.take() {
                        kill_child(&mut child).await;
                    }
                    self.state.send_replace(SupervisorState::Crashed);
                }
                let secs = self.config.readiness_timeout.as_secs();
                tracing::error!(timeout_secs = secs, "Engine readiness timeout");
                return Err(SupervisorError::ReadinessTimeout { secs });
            }

            tokio::time::sleep(self.config.probe_interval.min(deadline - now)).await;
        }
    }

    /// Wait for an in-flight start by another caller.
    async fn wait_for_start(&self) -> bool {
        let mut rx = self.state.subscribe();
        let outcome = rx
            .wait_for(|s| *s != SupervisorState::Starting)
            .await
            .map(|state| *state);
        matches!(outcome, Ok(SupervisorState::Ready))
    }
}

#[async_trait::async_trait]
impl HealthProbe for Supervisor {
    /// Alive process and a responsive engine.
    async fn is_healthy(&self) -> bool {
        self.is_process_alive().await && self.probe.is_healthy().await
    }
}

/// Health probe pinned to one engine process.
///
/// Reports unhealthy once the supervisor has spawned a different
/// process, even if that one is up. Prompts queued on the old process
/// are gone, so a job polling for them must stop.
pub struct GenerationProbe {
    supervisor: SupervisorHandle,
    generation: u64,
}

impl GenerationProbe {
    /// Pin to the process currently owned by `supervisor`.
    pub async fn pin(supervisor: SupervisorHandle) -> Self {
        let generation = supervisor.generation().await;
        Self {
            supervisor,
            generation,
        }
    }
}

#[async_trait::async_trait]
impl HealthProbe for GenerationProbe {
    async fn is_healthy(&self) -> bool {
        let current = self.supervisor.generation().await;
        if current != self.generation {
            tracing::warn!(
                pinned = self.generation,
                current,
                "Engine was restarted while a job was running",
            );
            return false;
        }
        self.supervisor.is_healthy().await
    }
}

/// Marks an abandoned start as crashed so later callers retry instead
/// of waiting forever on `Starting`.
struct StartingGuard<'a> {
    state: &'a watch::Sender<SupervisorState>,
    armed: bool,
}

impl<'a> StartingGuard<'a> {
    fn new(state: &'a watch::Sender<SupervisorState>) -> Self {
        Self { state, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.send_if_modified(|s| {
                if *s == SupervisorState::Starting {
                    *s = SupervisorState::Crashed;
                    true
                } else {
                    false
                }
            });
        }
    }
}

/// Take the child out of `process` if it has exited.
fn reap_exited(process: &mut SupervisedProcess) -> Option<ExitStatus> {
    let status = process.child.as_mut()?.try_wait().ok().flatten()?;
    process.child = None;
    Some(status)
}

async fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Kill of engine process failed (already exited?)");
    }
}
