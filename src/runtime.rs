use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

use crate::model::{ContainerStatus, HealthProbe};

const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    #[error("{command} failed ({exit}): {stderr}")]
    CommandFailed {
        command: String,
        exit: String,
        stderr: String,
    },

    #[error("health probe error: {0}")]
    Probe(String),
}

impl RuntimeError {
    pub fn code(&self) -> &'static str {
        match self {
            RuntimeError::Unavailable(_) => "runtime-unavailable",
            RuntimeError::CommandFailed { .. } => "command-failed",
            RuntimeError::Probe(_) => "probe-error",
        }
    }
}

/// Everything the runtime needs to materialize an instance. Kept to the
/// fields the update path mutates; the runtime derives the rest from the
/// image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image_ref: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy(String),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image_ref: &str) -> Result<(), RuntimeError>;
    /// Create a stopped instance; returns the runtime id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start(&self, runtime_id: &str) -> Result<(), RuntimeError>;
    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError>;
    async fn rename(&self, runtime_id: &str, new_name: &str) -> Result<(), RuntimeError>;
    async fn inspect_status(&self, runtime_id: &str) -> Result<ContainerStatus, RuntimeError>;
    async fn probe_health(
        &self,
        runtime_id: &str,
        probe: &HealthProbe,
    ) -> Result<HealthState, RuntimeError>;
    async fn prune_images(&self) -> Result<(), RuntimeError>;
}

#[derive(Debug)]
struct CommandOutput {
    success: bool,
    exit: String,
    stdout: String,
    stderr: String,
}

async fn run_quiet(program: &str, args: &[&str]) -> Result<CommandOutput, RuntimeError> {
    let rendered = format!("{program} {}", args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|err| RuntimeError::Unavailable(format!("{rendered}: {err}")))?;

    let exit = output
        .status
        .code()
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string());

    Ok(CommandOutput {
        success: output.status.success(),
        exit,
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

fn command_error(command: &str, output: &CommandOutput) -> RuntimeError {
    RuntimeError::CommandFailed {
        command: command.to_string(),
        exit: output.exit.clone(),
        stderr: output.stderr.clone(),
    }
}

/// Runtime client shelling out to the `podman` CLI.
pub struct PodmanRuntime;

impl PodmanRuntime {
    pub fn new() -> Self {
        Self
    }

    pub async fn health(&self) -> Result<(), RuntimeError> {
        let output = run_quiet("podman", &["--version"]).await?;
        if output.success {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable(format!(
                "podman --version exited {}",
                output.exit
            )))
        }
    }

    async fn simple(&self, args: &[&str]) -> Result<(), RuntimeError> {
        let output = run_quiet("podman", args).await?;
        if output.success {
            Ok(())
        } else {
            Err(command_error(&format!("podman {}", args.join(" ")), &output))
        }
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn parse_runtime_status(raw: &str) -> ContainerStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "created" | "configured" | "initialized" => ContainerStatus::Created,
        "running" => ContainerStatus::Running,
        "exited" | "stopped" => ContainerStatus::Exited,
        "paused" => ContainerStatus::Paused,
        "restarting" => ContainerStatus::Restarting,
        "removing" | "stopping" => ContainerStatus::Removing,
        _ => ContainerStatus::Dead,
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    async fn pull(&self, image_ref: &str) -> Result<(), RuntimeError> {
        self.simple(&["pull", image_ref]).await
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let args = ["create", "--name", spec.name.as_str(), spec.image_ref.as_str()];
        let output = run_quiet("podman", &args).await?;
        if !output.success {
            return Err(command_error(&format!("podman {}", args.join(" ")), &output));
        }
        let id = output.stdout.lines().last().unwrap_or("").trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::CommandFailed {
                command: format!("podman {}", args.join(" ")),
                exit: output.exit,
                stderr: "no container id on stdout".to_string(),
            });
        }
        Ok(id)
    }

    async fn start(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.simple(&["start", runtime_id]).await
    }

    async fn stop(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.simple(&["stop", runtime_id]).await
    }

    async fn remove(&self, runtime_id: &str) -> Result<(), RuntimeError> {
        self.simple(&["rm", "-f", runtime_id]).await
    }

    async fn rename(&self, runtime_id: &str, new_name: &str) -> Result<(), RuntimeError> {
        self.simple(&["rename", runtime_id, new_name]).await
    }

    async fn inspect_status(&self, runtime_id: &str) -> Result<ContainerStatus, RuntimeError> {
        let args = ["inspect", "--format", "{{.State.Status}}", runtime_id];
        let output = run_quiet("podman", &args).await?;
        if !output.success {
            return Err(command_error(&format!("podman {}", args.join(" ")), &output));
        }
        Ok(parse_runtime_status(&output.stdout))
    }

    async fn probe_health(
        &self,
        runtime_id: &str,
        probe: &HealthProbe,
    ) -> Result<HealthState, RuntimeError> {
        match probe {
            HealthProbe::Http { url } => {
                let client = reqwest::Client::builder()
                    .timeout(PROBE_ATTEMPT_TIMEOUT)
                    .build()
                    .map_err(|err| RuntimeError::Probe(err.to_string()))?;
                match client.get(url).send().await {
                    Ok(response) if response.status().is_success() => Ok(HealthState::Healthy),
                    Ok(response) => Ok(HealthState::Unhealthy(format!(
                        "http status {}",
                        response.status()
                    ))),
                    Err(err) => Ok(HealthState::Unhealthy(err.to_string())),
                }
            }
            HealthProbe::Tcp { addr } => {
                let connect = tokio::net::TcpStream::connect(addr);
                match tokio::time::timeout(PROBE_ATTEMPT_TIMEOUT, connect).await {
                    Ok(Ok(_)) => Ok(HealthState::Healthy),
                    Ok(Err(err)) => Ok(HealthState::Unhealthy(err.to_string())),
                    Err(_) => Ok(HealthState::Unhealthy("tcp connect timeout".to_string())),
                }
            }
            HealthProbe::Command { command } => {
                if command.is_empty() {
                    return Err(RuntimeError::Probe("empty probe command".to_string()));
                }
                let mut args = vec!["exec", runtime_id];
                args.extend(command.iter().map(String::as_str));
                let output = run_quiet("podman", &args).await?;
                if output.success {
                    Ok(HealthState::Healthy)
                } else {
                    Ok(HealthState::Unhealthy(format!(
                        "exit {}: {}",
                        output.exit, output.stderr
                    )))
                }
            }
        }
    }

    async fn prune_images(&self) -> Result<(), RuntimeError> {
        let output = run_quiet("podman", &["image", "prune", "-f"]).await?;
        if !output.success {
            warn!(exit = %output.exit, stderr = %output.stderr, "image prune failed");
        }
        Ok(())
    }
}
