//! Audit service configuration.
//!
//! Configuration is an explicit value constructed once at startup and passed
//! down — there is no process-wide registry. Sources merge in order (later
//! wins):
//!
//! 1. Compiled defaults
//! 2. Optional profile file (`.yaml`, `.yml`, or `.json`)
//! 3. Environment variable overrides
//!
//! Any string value of the form `${NAME}` is substituted from the environment
//! after merging.
//!
//! # Example
//!
//! ```rust
//! use txsentry::config::AuditConfig;
//!
//! let config = AuditConfig::default();
//! assert_eq!(config.pipeline.max_retries, 2);
//! assert!(config.pipeline.skip_planner);
//! assert_eq!(config.simulator.base_port, 8545);
//! ```

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::StageName;

/// Errors raised while loading or merging configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    #[diagnostic(code(txsentry::config::file_read))]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {format} config: {message}")]
    #[diagnostic(code(txsentry::config::parse))]
    Parse { format: &'static str, message: String },

    #[error("unsupported config file format: {message}")]
    #[diagnostic(
        code(txsentry::config::unsupported_format),
        help("file extension must be .yaml, .yml, or .json")
    )]
    UnsupportedFormat { message: String },

    #[error("failed to parse environment variable {key}: {message}")]
    #[diagnostic(code(txsentry::config::env_parse))]
    EnvParse { key: String, message: String },
}

/// Isolation backend selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationBackendKind {
    /// Container-based simulator, preferred for local runs and tests.
    ContainerSim,
    /// Cloud enclave driven through its native CLI.
    CloudEnclave,
    /// Placeholder backend; always reports unimplemented.
    Sgx,
}

impl Default for IsolationBackendKind {
    fn default() -> Self {
        IsolationBackendKind::ContainerSim
    }
}

/// Reasoning engine selection for verdict fusion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEngine {
    /// Deterministic pattern detectors only.
    RulesOnly,
    /// Detectors plus an advisory model opinion.
    RulesPlusModel,
    /// Deterministic mock oracle, for tests and offline runs.
    Mock,
}

impl Default for ReasoningEngine {
    fn default() -> Self {
        ReasoningEngine::RulesOnly
    }
}

/// Pipeline orchestration settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stages allowed to run. Perception, executor, and aggregator are
    /// structural and run regardless; this gates the optional stages.
    pub enabled_agents: Vec<String>,
    /// Skip the planner even for complex tasks.
    pub skip_planner: bool,
    /// Maximum executor re-runs triggered by reflection.
    pub max_retries: u32,
    /// Whole-audit deadline in seconds.
    pub timeout: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled_agents: vec![
                "perception".into(),
                "executor".into(),
                "reflection".into(),
                "aggregator".into(),
            ],
            skip_planner: true,
            max_retries: 2,
            timeout: 300.0,
        }
    }
}

impl PipelineConfig {
    /// Whether a stage is enabled by configuration.
    #[must_use]
    pub fn agent_enabled(&self, stage: StageName) -> bool {
        self.enabled_agents.iter().any(|s| s == stage.as_str())
    }

    /// The whole-audit deadline as a [`Duration`].
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.0))
    }
}

/// Forked-simulator settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Upstream JSON-RPC endpoint to fork from.
    pub fork_url: String,
    /// Pin the fork to a block number; `None` forks the latest block.
    pub fork_block: Option<u64>,
    /// Path to the EVM node binary.
    pub binary: String,
    /// First loopback port probed when starting an instance.
    pub base_port: u16,
    /// Startup and per-call deadline in seconds.
    pub timeout: f64,
    /// Maximum pooled simulator instances.
    pub pool_size: usize,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            fork_url: "https://eth.llamarpc.com".into(),
            fork_block: None,
            binary: "anvil".into(),
            base_port: 8545,
            timeout: 30.0,
            pool_size: 3,
        }
    }
}

impl SimulatorConfig {
    /// Startup/call deadline as a [`Duration`].
    #[must_use]
    pub fn deadline(&self) -> Duration {
        Duration::from_secs_f64(self.timeout.max(0.0))
    }
}

/// Isolation environment settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub backend: IsolationBackendKind,
    /// Image used by the container simulator backend.
    pub image: String,
    /// Whether measurement documents are produced on create.
    pub attestation_enabled: bool,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            backend: IsolationBackendKind::ContainerSim,
            image: "txsentry/tee-sim:latest".into(),
            attestation_enabled: true,
        }
    }
}

/// Reasoning settings.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub engine: ReasoningEngine,
}

/// HTTP listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
        }
    }
}

/// Complete service configuration. Immutable once constructed; the pipeline
/// holds it behind an `Arc` and never mutates it after perception runs.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub pipeline: PipelineConfig,
    pub simulator: SimulatorConfig,
    pub isolation: IsolationConfig,
    pub reasoning: ReasoningConfig,
    pub server: ServerConfig,
}

impl AuditConfig {
    /// Start building a configuration from compiled defaults.
    #[must_use]
    pub fn builder() -> AuditConfigBuilder {
        AuditConfigBuilder::default()
    }

    /// Convenience: defaults merged with environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::builder().with_env().build()
    }
}

/// Builder merging defaults, an optional profile file, and env overrides.
#[derive(Debug, Default)]
pub struct AuditConfigBuilder {
    base: AuditConfig,
    use_env: bool,
}

impl AuditConfigBuilder {
    /// Load a profile file, replacing the compiled defaults wholesale for any
    /// section the file mentions (unmentioned fields keep their defaults via
    /// `#[serde(default)]`).
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        self.base = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => {
                serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
                    format: "YAML",
                    message: e.to_string(),
                })?
            }
            Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
                format: "JSON",
                message: e.to_string(),
            })?,
            other => {
                return Err(ConfigError::UnsupportedFormat {
                    message: format!("unrecognized extension {other:?}"),
                })
            }
        };
        Ok(self)
    }

    /// Enable environment variable overrides (`TXSENTRY_*`).
    #[must_use]
    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    /// Merge all sources and apply `${NAME}` substitution.
    pub fn build(mut self) -> Result<AuditConfig, ConfigError> {
        if self.use_env {
            dotenvy::dotenv().ok();
            apply_env_overrides(&mut self.base)?;
        }
        substitute_config_vars(&mut self.base);
        Ok(self.base)
    }
}

fn apply_env_overrides(config: &mut AuditConfig) -> Result<(), ConfigError> {
    if let Ok(url) = std::env::var("TXSENTRY_FORK_URL") {
        config.simulator.fork_url = url;
    }
    if let Ok(raw) = std::env::var("TXSENTRY_FORK_BLOCK") {
        config.simulator.fork_block =
            Some(raw.parse().map_err(|_| ConfigError::EnvParse {
                key: "TXSENTRY_FORK_BLOCK".into(),
                message: "must be a block number".into(),
            })?);
    }
    if let Ok(binary) = std::env::var("TXSENTRY_SIMULATOR_BINARY") {
        config.simulator.binary = binary;
    }
    if let Ok(raw) = std::env::var("TXSENTRY_BASE_PORT") {
        config.simulator.base_port = raw.parse().map_err(|_| ConfigError::EnvParse {
            key: "TXSENTRY_BASE_PORT".into(),
            message: "must be a TCP port".into(),
        })?;
    }
    if let Ok(raw) = std::env::var("TXSENTRY_PIPELINE_TIMEOUT") {
        config.pipeline.timeout = raw.parse().map_err(|_| ConfigError::EnvParse {
            key: "TXSENTRY_PIPELINE_TIMEOUT".into(),
            message: "must be a number of seconds".into(),
        })?;
    }
    if let Ok(raw) = std::env::var("TXSENTRY_MAX_RETRIES") {
        config.pipeline.max_retries = raw.parse().map_err(|_| ConfigError::EnvParse {
            key: "TXSENTRY_MAX_RETRIES".into(),
            message: "must be a non-negative integer".into(),
        })?;
    }
    if let Ok(backend) = std::env::var("TXSENTRY_ISOLATION_BACKEND") {
        config.isolation.backend = match backend.as_str() {
            "container-sim" => IsolationBackendKind::ContainerSim,
            "cloud-enclave" => IsolationBackendKind::CloudEnclave,
            "sgx" => IsolationBackendKind::Sgx,
            _ => {
                return Err(ConfigError::EnvParse {
                    key: "TXSENTRY_ISOLATION_BACKEND".into(),
                    message: "must be 'container-sim', 'cloud-enclave', or 'sgx'".into(),
                })
            }
        };
    }
    if let Ok(host) = std::env::var("TXSENTRY_HOST") {
        config.server.host = host;
    }
    if let Ok(raw) = std::env::var("TXSENTRY_PORT") {
        config.server.port = raw.parse().map_err(|_| ConfigError::EnvParse {
            key: "TXSENTRY_PORT".into(),
            message: "must be a TCP port".into(),
        })?;
    }
    Ok(())
}

/// Replace `${NAME}` values with the environment variable `NAME`, leaving the
/// placeholder intact when the variable is unset.
fn substitute_config_vars(config: &mut AuditConfig) {
    for value in [
        &mut config.simulator.fork_url,
        &mut config.simulator.binary,
        &mut config.isolation.image,
        &mut config.server.host,
    ] {
        if let Some(substituted) = substitute_env_placeholder(value) {
            *value = substituted;
        }
    }
}

fn substitute_env_placeholder(value: &str) -> Option<String> {
    let name = value.strip_prefix("${")?.strip_suffix('}')?;
    std::env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_contract() {
        let config = AuditConfig::default();
        assert_eq!(config.pipeline.max_retries, 2);
        assert!(config.pipeline.skip_planner);
        assert_eq!(config.pipeline.timeout, 300.0);
        assert!(!config.pipeline.agent_enabled(StageName::Planner));
        assert!(config.pipeline.agent_enabled(StageName::Reflection));
        assert_eq!(config.simulator.binary, "anvil");
        assert_eq!(config.simulator.pool_size, 3);
        assert_eq!(config.isolation.backend, IsolationBackendKind::ContainerSim);
        assert_eq!(config.reasoning.engine, ReasoningEngine::RulesOnly);
    }

    #[test]
    fn yaml_profile_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "pipeline:\n  max_retries: 1\n  timeout: 15\nsimulator:\n  base_port: 9100"
        )
        .unwrap();

        let config = AuditConfig::builder()
            .with_file(file.path())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.pipeline.max_retries, 1);
        assert_eq!(config.pipeline.timeout, 15.0);
        assert_eq!(config.simulator.base_port, 9100);
        // Unmentioned sections keep their defaults.
        assert_eq!(config.simulator.binary, "anvil");
    }

    #[test]
    fn rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let err = AuditConfig::builder().with_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat { .. }));
    }

    #[test]
    fn placeholder_substitution() {
        std::env::set_var("TXSENTRY_TEST_RPC", "http://10.0.0.5:8545");
        let mut config = AuditConfig::default();
        config.simulator.fork_url = "${TXSENTRY_TEST_RPC}".into();
        substitute_config_vars(&mut config);
        assert_eq!(config.simulator.fork_url, "http://10.0.0.5:8545");
        std::env::remove_var("TXSENTRY_TEST_RPC");
    }

    #[test]
    fn placeholder_left_intact_when_unset() {
        let mut config = AuditConfig::default();
        config.simulator.fork_url = "${TXSENTRY_DEFINITELY_UNSET}".into();
        substitute_config_vars(&mut config);
        assert_eq!(config.simulator.fork_url, "${TXSENTRY_DEFINITELY_UNSET}");
    }
}
