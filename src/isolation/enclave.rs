//! Cloud-enclave backend driven through its native CLI.

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use uuid::Uuid;

use super::{EnvironmentSpec, IsolationBackend, IsolationError};

pub struct CloudEnclaveBackend {
    cli_path: String,
}

impl CloudEnclaveBackend {
    #[must_use]
    pub fn new(cli_path: impl Into<String>) -> Self {
        Self {
            cli_path: cli_path.into(),
        }
    }

    async fn ensure_cli(&self) -> Result<(), IsolationError> {
        let output = Command::new(&self.cli_path)
            .arg("describe-enclaves")
            .output()
            .await
            .map_err(|e| IsolationError::BackendUnavailable {
                message: format!("{} not available: {e}", self.cli_path),
            })?;
        if !output.status.success() {
            return Err(IsolationError::BackendUnavailable {
                message: format!(
                    "{} describe-enclaves failed: {}",
                    self.cli_path,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

impl Default for CloudEnclaveBackend {
    fn default() -> Self {
        Self::new("nitro-cli")
    }
}

#[async_trait]
impl IsolationBackend for CloudEnclaveBackend {
    fn label(&self) -> &'static str {
        "cloud-enclave"
    }

    async fn create(&self, spec: &EnvironmentSpec) -> Result<String, IsolationError> {
        self.ensure_cli().await?;

        let name = format!("txsentry-{}", Uuid::new_v4().simple());
        let output = Command::new(&self.cli_path)
            .args([
                "run-enclave",
                "--cpu-count",
                &spec.cpus.to_string(),
                "--memory",
                &spec.memory_mb.to_string(),
                "--enclave-name",
                &name,
            ])
            .output()
            .await
            .map_err(|e| IsolationError::CreateFailed {
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(IsolationError::CreateFailed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let parsed: Value =
            serde_json::from_slice(&output.stdout).map_err(|e| IsolationError::CreateFailed {
                message: format!("unreadable run-enclave output: {e}"),
            })?;
        parsed
            .get("EnclaveID")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IsolationError::CreateFailed {
                message: "run-enclave output missing EnclaveID".into(),
            })
    }

    async fn destroy(&self, env_id: &str) -> Result<(), IsolationError> {
        let output = Command::new(&self.cli_path)
            .args(["terminate-enclave", "--enclave-id", env_id])
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
        let output = Command::new(&self.cli_path)
            .arg("describe-enclaves")
            .output()
            .await
            .map_err(|e| IsolationError::BackendUnavailable {
                message: format!("{} not available: {e}", self.cli_path),
            })?;
        let parsed: Value = serde_json::from_slice(&output.stdout).unwrap_or(Value::Null);
        let running = parsed
            .as_array()
            .map(|enclaves| {
                enclaves.iter().any(|e| {
                    e.get("EnclaveID").and_then(Value::as_str) == Some(env_id)
                })
            })
            .unwrap_or(false);
        Ok(running)
    }
}
