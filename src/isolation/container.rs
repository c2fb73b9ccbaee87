//! Container-based isolation simulator.
//!
//! Runs the environment as a locked-down container: hard memory/CPU caps,
//! no privilege escalation, all capabilities dropped, read-only root.
//! Preferred backend for local runs and CI.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use super::{EnvironmentSpec, IsolationBackend, IsolationError};

pub struct ContainerSimBackend {
    image: String,
}

impl ContainerSimBackend {
    #[must_use]
    pub fn new(image: String) -> Self {
        Self { image }
    }
}

#[async_trait]
impl IsolationBackend for ContainerSimBackend {
    fn label(&self) -> &'static str {
        "container-sim"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<String, IsolationError> {
        let name = format!("txsentry-tee-{}", Uuid::new_v4().simple());
        let output = Command::new("docker")
            .args([
                "run",
                "-d",
                "--name",
                &name,
                "--memory",
                &format!("{}m", spec.memory_mb),
                "--cpus",
                &spec.cpus.to_string(),
                "--security-opt",
                "no-new-privileges",
                "--cap-drop",
                "ALL",
                "--read-only",
                "-e",
                "TEE_SIMULATION=true",
                &self.image,
                "sleep",
                "infinity",
            ])
            .output()
            .await
            .map_err(|e| IsolationError::BackendUnavailable {
                message: format!("docker not available: {e}"),
            })?;

        if !output.status.success() {
            return Err(IsolationError::CreateFailed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(container = %name, "isolation container started");
        Ok(name)
    }

    async fn destroy(&self, env_id: &str) -> Result<(), IsolationError> {
        let output = Command::new("docker")
            .args(["rm", "-f", env_id])
            .output()
            .await
            .map_err(|e| IsolationError::DestroyFailed {
                env_id: env_id.to_string(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(IsolationError::DestroyFailed {
                env_id: env_id.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn is_running(&self, env_id: &str) -> Result<bool, IsolationError> {
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", env_id])
            .output()
            .await
            .map_err(|e| IsolationError::BackendUnavailable {
                message: format!("docker not available: {e}"),
            })?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }
}
