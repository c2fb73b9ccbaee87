//! Isolated execution environments and per-audit ephemeral keys.
//!
//! An [`IsolationManager`] owns at most one environment at a time, created
//! through an interchangeable [`IsolationBackend`]. Ephemeral keys are scoped
//! to the environment they were generated under: destroying the environment
//! wipes the key material and invalidates every key id issued for it.

pub mod container;
pub mod enclave;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::Mutex;
use rand::RngCore;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::{IsolationBackendKind, IsolationConfig};

/// Errors raised by isolation management.
#[derive(Debug, Error, Diagnostic)]
pub enum IsolationError {
    #[error("isolation backend unavailable: {message}")]
    #[diagnostic(code(txsentry::isolation::unavailable))]
    BackendUnavailable { message: String },

    #[error("failed to create environment: {message}")]
    #[diagnostic(code(txsentry::isolation::create))]
    CreateFailed { message: String },

    #[error("failed to destroy environment {env_id}: {message}")]
    #[diagnostic(code(txsentry::isolation::destroy))]
    DestroyFailed { env_id: String, message: String },

    #[error("the {backend} backend is not implemented")]
    #[diagnostic(
        code(txsentry::isolation::unimplemented),
        help("Select the container-sim or cloud-enclave backend.")
    )]
    Unimplemented { backend: &'static str },

    #[error("no active environment")]
    #[diagnostic(code(txsentry::isolation::no_environment))]
    NoEnvironment,

    #[error("invalid resource request: {message}")]
    #[diagnostic(code(txsentry::isolation::invalid_spec))]
    InvalidSpec { message: String },

    #[error("stale or unknown key id: {key_id}")]
    #[diagnostic(
        code(txsentry::isolation::stale_key),
        help("Keys die with the environment they were generated under.")
    )]
    StaleKey { key_id: String },
}

/// Resource caps requested for an environment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub memory_mb: u32,
    pub cpus: u32,
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpus: 2,
        }
    }
}

impl EnvironmentSpec {
    fn validate(&self) -> Result<(), IsolationError> {
        if !(128..=32_768).contains(&self.memory_mb) {
            return Err(IsolationError::InvalidSpec {
                message: format!("memory_mb {} outside 128..=32768", self.memory_mb),
            });
        }
        if !(1..=64).contains(&self.cpus) {
            return Err(IsolationError::InvalidSpec {
                message: format!("cpus {} outside 1..=64", self.cpus),
            });
        }
        Ok(())
    }
}

/// Backend seam: brings up an isolated process group with resource caps and
/// no privilege escalation, and exposes the handle used for teardown.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short backend label used in measurement documents.
    fn label(&self) -> &'static str;

    /// Create an environment; returns its backend-assigned id.
    async fn create(&self, spec: &EnvironmentSpec) -> Result<String, IsolationError>;

    async fn destroy(&self, env_id: &str) -> Result<(), IsolationError>;

    /// Read-only liveness probe.
    async fn is_running(&self, env_id: &str) -> Result<bool, IsolationError>;
}

/// Placeholder SGX backend: reports a clear unimplemented error.
pub struct SgxBackend;

#[async_trait]
impl IsolationBackend for SgxBackend {
    fn label(&self) -> &'static str {
        "sgx"
    }

    async fn create(&self, _spec: &EnvironmentSpec) -> Result<String, IsolationError> {
        Err(IsolationError::Unimplemented { backend: "sgx" })
    }

    async fn destroy(&self, _env_id: &str) -> Result<(), IsolationError> {
        Err(IsolationError::Unimplemented { backend: "sgx" })
    }

    async fn is_running(&self, _env_id: &str) -> Result<bool, IsolationError> {
        Err(IsolationError::Unimplemented { backend: "sgx" })
    }
}

/// Measurement document over the current environment.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeasurementDocument {
    pub version: String,
    pub tee_type: String,
    pub environment_id: String,
    pub pcr0: String,
    pub pcr1: String,
    pub timestamp: DateTime<Utc>,
}

/// Public view of an ephemeral key. The private material never leaves the
/// manager.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyInfo {
    pub key_id: String,
    pub key_type: String,
    pub scope: String,
    pub address: String,
}

/// Point-in-time status report. Reading it has no side effects.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IsolationStatus {
    pub environment_id: Option<String>,
    pub running: bool,
    pub backend: &'static str,
    pub active_keys: Vec<String>,
}

struct EphemeralKey {
    info: KeyInfo,
    environment_id: String,
    _secret: Zeroizing<[u8; 32]>,
}

struct ActiveEnvironment {
    id: String,
    created_at: DateTime<Utc>,
    spec: EnvironmentSpec,
}

#[derive(Default)]
struct ManagerState {
    environment: Option<ActiveEnvironment>,
    keys: FxHashMap<String, EphemeralKey>,
}

/// Single-audit isolation manager. Not shared across audits; the status
/// report is a snapshot under the manager's own lock.
pub struct IsolationManager {
    backend: Arc<dyn IsolationBackend>,
    attestation_enabled: bool,
    state: Mutex<ManagerState>,
}

impl IsolationManager {
    #[must_use]
    pub fn new(backend: Arc<dyn IsolationBackend>, attestation_enabled: bool) -> Self {
        Self {
            backend,
            attestation_enabled,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Construct the backend selected by configuration.
    #[must_use]
    pub fn from_config(config: &IsolationConfig) -> Self {
        let backend: Arc<dyn IsolationBackend> = match config.backend {
            IsolationBackendKind::ContainerSim => {
                Arc::new(container::ContainerSimBackend::new(config.image.clone()))
            }
            IsolationBackendKind::CloudEnclave => {
                Arc::new(enclave::CloudEnclaveBackend::default())
            }
            IsolationBackendKind::Sgx => Arc::new(SgxBackend),
        };
        Self::new(backend, config.attestation_enabled)
    }

    /// Create the environment. Returns its id and, when attestation is
    /// enabled, the initial measurement document.
    pub async fn create(
        &self,
        spec: EnvironmentSpec,
    ) -> Result<(String, Option<MeasurementDocument>), IsolationError> {
        spec.validate()?;
        let env_id = self.backend.create(&spec).await?;
        let created_at = Utc::now();
        {
            let mut state = self.state.lock();
            state.environment = Some(ActiveEnvironment {
                id: env_id.clone(),
                created_at,
                spec,
            });
        }
        let document = self
            .attestation_enabled
            .then(|| self.measure(&env_id, created_at));
        Ok((env_id, document))
    }

    /// Destroy the environment and erase every key generated under it.
    pub async fn destroy(&self) -> Result<(), IsolationError> {
        let env_id = {
            let state = self.state.lock();
            state.environment.as_ref().map(|e| e.id.clone())
        };
        let Some(env_id) = env_id else {
            return Ok(());
        };
        let result = self.backend.destroy(&env_id).await;
        {
            let mut state = self.state.lock();
            state.environment = None;
            // Dropping the entries zeroizes the secrets.
            state.keys.clear();
        }
        result
    }

    /// Generate an ephemeral key scoped to the active environment.
    pub fn generate_key(&self, key_type: &str, scope: &str) -> Result<KeyInfo, IsolationError> {
        let mut state = self.state.lock();
        let env_id = state
            .environment
            .as_ref()
            .map(|e| e.id.clone())
            .ok_or(IsolationError::NoEnvironment)?;

        let mut secret = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(secret.as_mut());

        let mut tag = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut tag);
        let key_id = format!("{key_type}_{scope}_{}", hex::encode(tag));

        let digest = Sha256::digest(secret.as_ref());
        let address = format!("0x{}", hex::encode(&digest[12..32]));

        let info = KeyInfo {
            key_id: key_id.clone(),
            key_type: key_type.to_string(),
            scope: scope.to_string(),
            address,
        };
        state.keys.insert(
            key_id,
            EphemeralKey {
                info: info.clone(),
                environment_id: env_id,
                _secret: secret,
            },
        );
        Ok(info)
    }

    /// Resolve a key id. Fails for unknown ids and for keys whose environment
    /// has been destroyed.
    pub fn resolve_key(&self, key_id: &str) -> Result<KeyInfo, IsolationError> {
        let state = self.state.lock();
        let key = state.keys.get(key_id).ok_or_else(|| IsolationError::StaleKey {
            key_id: key_id.to_string(),
        })?;
        let live = state
            .environment
            .as_ref()
            .is_some_and(|e| e.id == key.environment_id);
        if !live {
            return Err(IsolationError::StaleKey {
                key_id: key_id.to_string(),
            });
        }
        Ok(key.info.clone())
    }

    /// Current measurement document. Requires an active environment.
    pub fn get_attestation(&self) -> Result<MeasurementDocument, IsolationError> {
        let state = self.state.lock();
        let env = state.environment.as_ref().ok_or(IsolationError::NoEnvironment)?;
        Ok(self.measure(&env.id, env.created_at))
    }

    /// Side-effect-free status snapshot.
    #[must_use]
    pub fn status(&self) -> IsolationStatus {
        let state = self.state.lock();
        IsolationStatus {
            environment_id: state.environment.as_ref().map(|e| e.id.clone()),
            running: state.environment.is_some(),
            backend: self.backend.label(),
            active_keys: state.keys.keys().cloned().collect(),
        }
    }

    /// Resource spec of the active environment, for reports.
    #[must_use]
    pub fn active_spec(&self) -> Option<EnvironmentSpec> {
        self.state.lock().environment.as_ref().map(|e| e.spec)
    }

    fn measure(&self, env_id: &str, created_at: DateTime<Utc>) -> MeasurementDocument {
        // PCR0 digests the canonical (sorted-key) environment metadata; the
        // simulator has no second register and reports zeros for PCR1.
        let metadata = json!({
            "backend": self.backend.label(),
            "created_at": created_at.to_rfc3339(),
            "id": env_id,
        });
        let canonical = serde_json::to_vec(&metadata).unwrap_or_default();
        let pcr0 = hex::encode(Sha256::digest(&canonical));
        MeasurementDocument {
            version: "OML_1.0".into(),
            tee_type: tee_type_label(self.backend.label()),
            environment_id: env_id.to_string(),
            pcr0,
            pcr1: "0".repeat(64),
            timestamp: Utc::now(),
        }
    }
}

fn tee_type_label(backend: &str) -> String {
    match backend {
        "cloud-enclave" => "CLOUD_ENCLAVE".to_string(),
        "sgx" => "INTEL_SGX".to_string(),
        _ => "SIMULATED_TEE".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory backend used to exercise the manager without docker.
    pub(crate) struct ScriptedBackend {
        created: AtomicU32,
    }

    impl ScriptedBackend {
        pub(crate) fn new() -> Self {
            Self {
                created: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl IsolationBackend for ScriptedBackend {
        fn label(&self) -> &'static str {
            "container-sim"
        }

        async fn create(&self, _spec: &EnvironmentSpec) -> Result<String, IsolationError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("env-{n}"))
        }

        async fn destroy(&self, _env_id: &str) -> Result<(), IsolationError> {
            Ok(())
        }

        async fn is_running(&self, _env_id: &str) -> Result<bool, IsolationError> {
            Ok(true)
        }
    }

    fn manager() -> IsolationManager {
        IsolationManager::new(Arc::new(ScriptedBackend::new()), true)
    }

    #[tokio::test]
    async fn create_then_status_then_destroy() {
        let manager = manager();
        assert!(!manager.status().running);

        let (env_id, doc) = manager.create(EnvironmentSpec::default()).await.unwrap();
        assert_eq!(env_id, "env-0");
        let doc = doc.unwrap();
        assert_eq!(doc.pcr0.len(), 64);
        assert_eq!(doc.pcr1, "0".repeat(64));

        let status = manager.status();
        assert!(status.running);
        assert_eq!(status.environment_id.as_deref(), Some("env-0"));

        manager.destroy().await.unwrap();
        let status = manager.status();
        assert!(!status.running);
        assert!(status.environment_id.is_none());
    }

    #[tokio::test]
    async fn keys_die_with_their_environment() {
        let manager = manager();
        manager.create(EnvironmentSpec::default()).await.unwrap();

        let key = manager.generate_key("ephemeral", "transaction").unwrap();
        assert!(key.key_id.starts_with("ephemeral_transaction_"));
        assert_eq!(key.address.len(), 42);
        assert!(manager.resolve_key(&key.key_id).is_ok());

        manager.destroy().await.unwrap();
        let err = manager.resolve_key(&key.key_id).unwrap_err();
        assert!(matches!(err, IsolationError::StaleKey { .. }));
        assert!(manager.status().active_keys.is_empty());
    }

    #[tokio::test]
    async fn key_generation_requires_environment() {
        let manager = manager();
        let err = manager.generate_key("ephemeral", "transaction").unwrap_err();
        assert!(matches!(err, IsolationError::NoEnvironment));
    }

    #[tokio::test]
    async fn attestation_requires_environment() {
        let manager = manager();
        assert!(matches!(
            manager.get_attestation().unwrap_err(),
            IsolationError::NoEnvironment
        ));
    }

    #[tokio::test]
    async fn rejects_out_of_range_specs() {
        let manager = manager();
        let err = manager
            .create(EnvironmentSpec {
                memory_mb: 64,
                cpus: 2,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, IsolationError::InvalidSpec { .. }));
    }

    #[tokio::test]
    async fn sgx_backend_reports_unimplemented() {
        let manager = IsolationManager::new(Arc::new(SgxBackend), false);
        let err = manager.create(EnvironmentSpec::default()).await.unwrap_err();
        assert!(matches!(err, IsolationError::Unimplemented { backend: "sgx" }));
    }

    #[test]
    fn measurement_is_deterministic_for_fixed_metadata() {
        let manager = manager();
        let when = Utc::now();
        let a = manager.measure("env-7", when);
        let b = manager.measure("env-7", when);
        assert_eq!(a.pcr0, b.pcr0);
    }
}
