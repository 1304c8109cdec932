//! Sandbox driver: the abstraction over the container runtime.
//!
//! `SandboxRuntime` is the only way the rest of the orchestrator touches
//! containers: create, start, inspect, exec, PTY attach, remove, list.
//! `DockerRuntime` is the production implementation over docktopus/bollard;
//! tests use the scripted [`mock::MockRuntime`].
//!
//! The driver holds no state of its own: anything `inspect` can answer is
//! asked of the runtime every time.

use async_trait::async_trait;
use docktopus::DockerBuilder;
use docktopus::bollard::container::{
    Config as BollardConfig, InspectContainerOptions, ListContainersOptions, LogOutput,
    RemoveContainerOptions, StartContainerOptions,
};
use docktopus::bollard::exec::{
    CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults,
};
use docktopus::bollard::models::HostConfig;
use docktopus::container::Container;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::OnceCell as AsyncOnceCell;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};

/// Label attached to every container this orchestrator creates, used to
/// scope `list` calls to our own sandboxes.
pub const MANAGED_LABEL: &str = "devyard.managed";
/// Label carrying the owning environment id.
pub const ENVIRONMENT_LABEL: &str = "devyard.environment";

/// A read-write bind mount requested at sandbox creation.
#[derive(Clone, Debug)]
pub struct MountSpec {
    pub host_path: std::path::PathBuf,
    pub sandbox_path: String,
    pub read_only: bool,
}

impl MountSpec {
    fn to_bind(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.host_path.display(), self.sandbox_path, mode)
    }
}

/// Parameters for sandbox creation.
#[derive(Clone, Debug, Default)]
pub struct SandboxSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub mounts: Vec<MountSpec>,
}

/// One in-sandbox command invocation.
#[derive(Clone, Debug, Default)]
pub struct ExecSpec {
    pub argv: Vec<String>,
    pub workdir: Option<String>,
    pub env: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    /// Overrides the configured exec timeout (git network operations get a
    /// longer budget than plain commands).
    pub timeout: Option<Duration>,
}

impl ExecSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExecSpec {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn in_dir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Separated output of a finished exec.
#[derive(Clone, Debug, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        ExecOutput {
            stdout: stdout.into(),
            stderr: String::new(),
            code: 0,
        }
    }

    pub fn fail(code: i64, stderr: impl Into<String>) -> Self {
        ExecOutput {
            stdout: String::new(),
            stderr: stderr.into(),
            code,
        }
    }
}

/// Result of `inspect`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SandboxStatus {
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtySize {
    pub cols: u16,
    pub rows: u16,
}

/// A live TTY exec inside a sandbox: raw byte stream out, writer in,
/// resizable through the driver while the exec id is alive.
pub struct PtyConnection {
    pub exec_id: String,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    pub output: BoxStream<'static, Result<Vec<u8>>>,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Create and start a sandbox container; returns the runtime handle.
    async fn create(&self, spec: &SandboxSpec) -> Result<String>;
    /// Start a stopped sandbox. Idempotent on an already-running handle.
    async fn start(&self, handle: &str) -> Result<()>;
    async fn inspect(&self, handle: &str) -> Result<SandboxStatus>;
    /// Run a command to completion, capturing separated stdout/stderr and
    /// the exit code.
    async fn exec(&self, handle: &str, spec: ExecSpec) -> Result<ExecOutput>;
    /// Start an interactive TTY exec (e.g. `tmux attach-session`).
    async fn attach_pty(
        &self,
        handle: &str,
        argv: Vec<String>,
        workdir: Option<String>,
        size: PtySize,
    ) -> Result<PtyConnection>;
    /// Resize the TTY of a live exec.
    async fn resize_pty(&self, exec_id: &str, size: PtySize) -> Result<()>;
    async fn remove(&self, handle: &str, force: bool) -> Result<()>;
    /// Handles of all managed sandboxes known to the runtime.
    async fn list(&self) -> Result<Vec<String>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Docker implementation
// ─────────────────────────────────────────────────────────────────────────────

pub struct DockerRuntime {
    builder: DockerBuilder,
    image_pulled: AsyncOnceCell<()>,
}

impl DockerRuntime {
    /// Connect to the docker daemon, honoring `DOCKER_HOST` when set.
    pub async fn connect(config: &OrchestratorConfig) -> Result<Self> {
        let builder = match config.docker_host.as_deref() {
            Some(host) => DockerBuilder::with_address(host).await.map_err(|err| {
                OrchestratorError::Runtime(format!("Failed to connect to docker at {host}: {err}"))
            })?,
            None => DockerBuilder::new().await.map_err(|err| {
                OrchestratorError::Runtime(format!("Failed to connect to docker: {err}"))
            })?,
        };
        Ok(Self {
            builder,
            image_pulled: AsyncOnceCell::const_new(),
        })
    }

    /// Pull the sandbox image once on first use if configured to do so.
    async fn ensure_image_pulled(&self, image: &str) -> Result<()> {
        self.image_pulled
            .get_or_try_init(|| async {
                let config = OrchestratorConfig::load();
                if config.pull_image {
                    self.builder.pull_image(image, None).await.map_err(|err| {
                        OrchestratorError::Runtime(format!("Failed to pull image {image}: {err}"))
                    })?;
                }
                Ok::<(), OrchestratorError>(())
            })
            .await?;
        Ok(())
    }
}

/// Map a bollard API error onto the orchestrator taxonomy.
fn classify_docker_err(context: &str, err: docktopus::bollard::errors::Error) -> OrchestratorError {
    use docktopus::bollard::errors::Error as Docker;
    match &err {
        Docker::DockerResponseServerError {
            status_code,
            message,
        } => match *status_code {
            404 => OrchestratorError::NotFound(format!("{context}: {message}")),
            409 => OrchestratorError::conflict(format!("{context}: {message}")),
            403 => OrchestratorError::Runtime(format!("{context}: permission denied: {message}")),
            507 => OrchestratorError::Resource(format!("{context}: {message}")),
            _ => OrchestratorError::Runtime(format!("{context}: {message}")),
        },
        _ => OrchestratorError::Runtime(format!("{context}: {err}")),
    }
}

/// Classify a docktopus container-op error from its message. The container
/// helper flattens bollard errors to strings, so sniffing is all we have.
fn classify_container_err(context: &str, message: String) -> OrchestratorError {
    let lowered = message.to_lowercase();
    if lowered.contains("already in use") || lowered.contains("conflict") {
        OrchestratorError::conflict(format!("{context}: {message}"))
    } else if lowered.contains("no such container") {
        OrchestratorError::NotFound(format!("{context}: {message}"))
    } else if lowered.contains("no space left") {
        OrchestratorError::Resource(format!("{context}: {message}"))
    } else {
        OrchestratorError::Runtime(format!("{context}: {message}"))
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<String> {
        self.ensure_image_pulled(&spec.image).await?;

        let mut labels: HashMap<String, String> = spec.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let host_config = HostConfig {
            binds: if spec.mounts.is_empty() {
                None
            } else {
                Some(spec.mounts.iter().map(MountSpec::to_bind).collect())
            },
            ..Default::default()
        };

        let override_config = BollardConfig {
            // Keep the container alive; all work happens through exec.
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let mut container = Container::new(self.builder.client(), spec.image.clone())
            .with_name(spec.name.clone())
            .env(spec.env.clone())
            .config_override(override_config);

        container
            .start(false)
            .await
            .map_err(|err| classify_container_err("Failed to start sandbox container", err.to_string()))?;

        let handle = container
            .id()
            .ok_or_else(|| OrchestratorError::Runtime("Missing container id".into()))?
            .to_string();

        Ok(handle)
    }

    async fn start(&self, handle: &str) -> Result<()> {
        self.builder
            .client()
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| classify_docker_err("Failed to start container", err))?;
        Ok(())
    }

    async fn inspect(&self, handle: &str) -> Result<SandboxStatus> {
        let inspect = self
            .builder
            .client()
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(|err| classify_docker_err("Failed to inspect container", err))?;

        let state = inspect.state.unwrap_or_default();
        Ok(SandboxStatus {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }

    async fn exec(&self, handle: &str, spec: ExecSpec) -> Result<ExecOutput> {
        let client = self.builder.client();
        let timeout = spec
            .timeout
            .unwrap_or(OrchestratorConfig::load().exec_timeout);

        let exec = client
            .create_exec(
                handle,
                CreateExecOptions::<String> {
                    attach_stdin: Some(spec.stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(false),
                    cmd: Some(spec.argv.clone()),
                    env: if spec.env.is_empty() {
                        None
                    } else {
                        Some(spec.env.clone())
                    },
                    working_dir: spec.workdir.clone(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| classify_docker_err("Failed to create exec", err))?;

        let run = async {
            let mut stdout: Vec<u8> = Vec::new();
            let mut stderr: Vec<u8> = Vec::new();

            match client
                .start_exec(&exec.id, None::<StartExecOptions>)
                .await
                .map_err(|err| classify_docker_err("Failed to start exec", err))?
            {
                StartExecResults::Attached { mut output, mut input } => {
                    if let Some(bytes) = &spec.stdin {
                        use tokio::io::AsyncWriteExt;
                        input.write_all(bytes).await.map_err(|err| {
                            OrchestratorError::Runtime(format!("Failed to write exec stdin: {err}"))
                        })?;
                        input.shutdown().await.ok();
                    }
                    while let Some(chunk) = output.next().await {
                        match chunk
                            .map_err(|err| classify_docker_err("Exec stream failed", err))?
                        {
                            LogOutput::StdOut { message } => stdout.extend_from_slice(&message),
                            LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                            LogOutput::Console { message } => stdout.extend_from_slice(&message),
                            LogOutput::StdIn { .. } => {}
                        }
                    }
                }
                StartExecResults::Detached => {}
            }

            let inspect = client
                .inspect_exec(&exec.id)
                .await
                .map_err(|err| classify_docker_err("Failed to inspect exec", err))?;

            Ok::<ExecOutput, OrchestratorError>(ExecOutput {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                code: inspect.exit_code.unwrap_or(-1),
            })
        };

        tokio::time::timeout(timeout, run).await.map_err(|_| {
            OrchestratorError::Runtime(format!(
                "Exec timed out after {}s: {}",
                timeout.as_secs(),
                spec.argv.join(" ")
            ))
        })?
    }

    async fn attach_pty(
        &self,
        handle: &str,
        argv: Vec<String>,
        workdir: Option<String>,
        size: PtySize,
    ) -> Result<PtyConnection> {
        let client = self.builder.client();

        let exec = client
            .create_exec(
                handle,
                CreateExecOptions::<String> {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    cmd: Some(argv),
                    working_dir: workdir,
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| classify_docker_err("Failed to create PTY exec", err))?;

        let results = client
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| classify_docker_err("Failed to start PTY exec", err))?;

        let (output, input) = match results {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(OrchestratorError::Runtime(
                    "PTY exec unexpectedly detached".into(),
                ));
            }
        };

        // Initial window size; later changes go through resize_pty.
        client
            .resize_exec(
                &exec.id,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await
            .ok();

        let bytes_out = output
            .map(|chunk| match chunk {
                Ok(log) => Ok(log.into_bytes().to_vec()),
                Err(err) => Err(classify_docker_err("PTY stream failed", err)),
            })
            .boxed();

        Ok(PtyConnection {
            exec_id: exec.id,
            input,
            output: bytes_out,
        })
    }

    async fn resize_pty(&self, exec_id: &str, size: PtySize) -> Result<()> {
        self.builder
            .client()
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: size.rows,
                    width: size.cols,
                },
            )
            .await
            .map_err(|err| classify_docker_err("Failed to resize PTY", err))?;
        Ok(())
    }

    async fn remove(&self, handle: &str, force: bool) -> Result<()> {
        let container = Container::from_id(self.builder.client(), handle)
            .await
            .map_err(|err| classify_container_err("Failed to load container", err.to_string()))?;
        container
            .remove(Some(RemoveContainerOptions {
                force,
                ..Default::default()
            }))
            .await
            .map_err(|err| classify_container_err("Failed to remove container", err.to_string()))?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{MANAGED_LABEL}=true")],
        );
        let containers = self
            .builder
            .client()
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|err| classify_docker_err("Failed to list containers", err))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.id)
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scripted mock for tests
// ─────────────────────────────────────────────────────────────────────────────
