//! Forked EVM simulation: sandbox lifecycle, transaction replay, and the
//! instance pool.
//!
//! The [`Simulator`] trait is the seam between the executor stage and the
//! sandbox. Production uses [`AnvilSimulator`](anvil::AnvilSimulator), which
//! forks mainnet state into a short-lived child node; tests script the trait
//! directly.
//!
//! The central invariant lives in [`Simulator::simulate`]: exactly one
//! observable execution per call, atomically reverted, so the node state
//! after the call equals the state before it on every exit path.

pub mod anvil;
pub mod models;
pub mod pool;
pub mod rpc;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use models::{AssetChange, CallTrace, EventLog, SimulationRequest, SimulationResult};
pub use pool::{PooledSimulator, SimulatorPool};
pub use rpc::RpcError;

/// Chain id every sandbox runs under, regardless of the forked chain.
pub const SANDBOX_CHAIN_ID: u64 = 31337;

/// Errors raised by simulator providers.
///
/// A reverted candidate transaction is **not** an error: it is reported inside
/// [`SimulationResult`] with `success: false`.
#[derive(Debug, Error, Diagnostic)]
pub enum SimulatorError {
    #[error("failed to start sandbox node: {message}")]
    #[diagnostic(
        code(txsentry::simulator::startup),
        help("Check that the node binary is installed and the fork URL is reachable.")
    )]
    Startup { message: String },

    #[error("no free port in {base}..{base}+{attempts}")]
    #[diagnostic(code(txsentry::simulator::port_exhausted))]
    PortExhausted { base: u16, attempts: u16 },

    #[error("sandbox node not ready within {seconds:.1}s")]
    #[diagnostic(code(txsentry::simulator::startup_timeout))]
    StartupTimeout { seconds: f64 },

    #[error(transparent)]
    #[diagnostic(code(txsentry::simulator::rpc))]
    Rpc(#[from] RpcError),

    #[error("transaction receipt not available within {seconds:.1}s")]
    #[diagnostic(code(txsentry::simulator::receipt_timeout))]
    ReceiptTimeout { seconds: f64 },

    #[error("simulator is not running")]
    #[diagnostic(code(txsentry::simulator::not_running))]
    NotRunning,

    #[error("unsupported operation: {message}")]
    #[diagnostic(code(txsentry::simulator::unsupported))]
    Unsupported { message: String },
}

impl SimulatorError {
    /// Whether reflection may retry this failure with a longer deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            SimulatorError::StartupTimeout { .. }
                | SimulatorError::ReceiptTimeout { .. }
                | SimulatorError::Rpc(RpcError::Timeout { .. })
        )
    }
}

/// Native balance report from [`Simulator::get_balance`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub address: String,
    pub token_symbol: String,
    /// Base units, decimal string.
    pub balance: String,
    pub whole_units: f64,
}

/// Contract code report from [`Simulator::get_code`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CodeInfo {
    pub address: String,
    pub is_contract: bool,
    pub code_length: usize,
    /// First 32 bytes of the code as hex, when a contract.
    pub code_hash_prefix: Option<String>,
}

/// One sandbox instance. Implementations serialize their own RPC mutation so
/// one instance never services two concurrent calls.
#[async_trait]
pub trait Simulator: Send + Sync {
    /// Start the sandbox if necessary. Returns the resolved fork block.
    async fn ensure_started(&self) -> Result<u64, SimulatorError>;

    /// Replay the candidate transaction inside a snapshot and revert.
    async fn simulate(&self, request: &SimulationRequest)
        -> Result<SimulationResult, SimulatorError>;

    /// Native balance of `address`. Token balances are unsupported here.
    async fn get_balance(
        &self,
        address: &str,
        token: Option<&str>,
    ) -> Result<BalanceInfo, SimulatorError>;

    /// Deployed code summary for `address`.
    async fn get_code(&self, address: &str) -> Result<CodeInfo, SimulatorError>;

    /// Tear the sandbox down. Idempotent.
    async fn shutdown(&self);

    /// Whether a child node is currently alive.
    async fn is_running(&self) -> bool;
}
