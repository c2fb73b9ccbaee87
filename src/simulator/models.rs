//! Data model for forked-simulator requests and results.
//!
//! These types form the contract between the executor stage and the
//! [`Simulator`](super::Simulator) providers: a validated request in, a fully
//! populated [`SimulationResult`] out. All monetary quantities are canonical
//! decimal strings of base-unit integers; addresses are 20-byte lowercase hex
//! with a `0x` prefix.

use serde::{Deserialize, Serialize};

use crate::types::RiskLevel;

/// The zero address, used as the token address of the native asset.
pub const NATIVE_ASSET: &str = "0x0000000000000000000000000000000000000000";

/// One whole unit of the native asset in base units (18 decimals).
pub const WHOLE_UNIT: i128 = 1_000_000_000_000_000_000;

/// A validated simulation request. Immutable once constructed via
/// [`SimulationRequest::validate`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationRequest {
    pub chain_id: u64,
    pub tx_from: String,
    pub tx_to: String,
    /// Canonical decimal string of the transferred base-unit amount.
    #[serde(default = "default_value")]
    pub tx_value: String,
    /// Lowercase `0x`-prefixed calldata.
    #[serde(default = "default_data")]
    pub tx_data: String,
    /// Pin the fork to a block; `None` forks the latest.
    #[serde(default)]
    pub fork_block: Option<u64>,
    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,
}

fn default_value() -> String {
    "0".to_string()
}

fn default_data() -> String {
    "0x".to_string()
}

fn default_gas_limit() -> u64 {
    30_000_000
}

impl SimulationRequest {
    /// Check the field invariants: both addresses are 20-byte lowercase hex,
    /// the value is a decimal integer, and the calldata is `0x` hex.
    ///
    /// Returns the first violated field name on failure.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !is_address(&self.tx_from) {
            return Err("tx_from");
        }
        if !is_address(&self.tx_to) {
            return Err("tx_to");
        }
        if self.tx_value.is_empty() || !self.tx_value.bytes().all(|b| b.is_ascii_digit()) {
            return Err("tx_value");
        }
        if !is_hex_data(&self.tx_data) {
            return Err("tx_data");
        }
        Ok(())
    }

    /// Declared transfer amount in base units.
    #[must_use]
    pub fn value_base_units(&self) -> i128 {
        self.tx_value.parse().unwrap_or(0)
    }
}

/// `true` for a 42-char lowercase `0x` address over valid hex digits.
#[must_use]
pub fn is_address(s: &str) -> bool {
    s.len() == 42
        && s.starts_with("0x")
        && s[2..]
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// `true` for `0x`-prefixed lowercase hex data (empty payload allowed).
#[must_use]
pub fn is_hex_data(s: &str) -> bool {
    s.starts_with("0x")
        && s[2..]
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Balance movement of one (holder, token) pair across the simulated call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetChange {
    pub holder: String,
    /// Token contract address; [`NATIVE_ASSET`] for the chain's native asset.
    pub token_address: String,
    pub token_symbol: String,
    pub token_decimals: u8,
    pub balance_before: String,
    pub balance_after: String,
    /// Signed delta in base units (decimal string).
    pub change_amount: String,
}

impl AssetChange {
    /// Signed delta in base units; 0 when the string is malformed.
    #[must_use]
    pub fn delta(&self) -> i128 {
        self.change_amount.parse().unwrap_or(0)
    }

    /// Whether this row tracks the native asset.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.token_address == NATIVE_ASSET
    }
}

/// One frame of the execution trace. The first frame (depth 0) is the
/// top-level call synthesized from the request; deeper frames come from the
/// node's struct logs.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTrace {
    pub depth: u32,
    pub from_address: String,
    pub to_address: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub input_data: String,
    #[serde(default)]
    pub output_data: String,
    #[serde(default)]
    pub gas_used: u64,
    #[serde(default)]
    pub call_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CallTrace {
    /// The 4-byte function selector of this frame, if present.
    #[must_use]
    pub fn selector(&self) -> Option<&str> {
        (self.input_data.len() >= 10 && self.input_data.starts_with("0x"))
            .then(|| &self.input_data[..10])
    }
}

/// One receipt log entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub log_index: u64,
}

/// Complete outcome of one simulated execution.
///
/// A reverted transaction is a *successful* simulation with `success: false`;
/// provider errors are reported through `SimulatorError` instead.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SimulationResult {
    pub chain_id: u64,
    /// Fork height the sandbox resolved to.
    pub block_number: u64,
    pub tx_from: String,
    pub tx_to: String,
    pub tx_value: String,
    pub tx_data: String,

    pub success: bool,
    pub gas_used: u64,
    pub gas_limit: u64,
    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub asset_changes: Vec<AssetChange>,
    #[serde(default)]
    pub call_traces: Vec<CallTrace>,
    #[serde(default)]
    pub events: Vec<EventLog>,

    /// Rule-detected anomaly descriptions; may be extended by reflection.
    #[serde(default)]
    pub anomalies: Vec<String>,
    #[serde(default)]
    pub risk_level: RiskLevel,
}

impl SimulationResult {
    /// Net native-asset delta of the sender, in base units.
    #[must_use]
    pub fn sender_native_delta(&self) -> i128 {
        self.asset_changes
            .iter()
            .filter(|c| c.is_native() && c.holder == self.tx_from)
            .map(AssetChange::delta)
            .sum()
    }

    /// Sum of all negative native deltas (a non-positive number).
    #[must_use]
    pub fn total_native_outflow(&self) -> i128 {
        self.asset_changes
            .iter()
            .filter(|c| c.is_native())
            .map(AssetChange::delta)
            .filter(|d| *d < 0)
            .sum()
    }

    /// Maximum call depth observed in the trace.
    #[must_use]
    pub fn max_call_depth(&self) -> u32 {
        self.call_traces.iter().map(|t| t.depth).max().unwrap_or(0)
    }

    /// Declared transfer amount in base units.
    #[must_use]
    pub fn declared_value(&self) -> i128 {
        self.tx_value.parse().unwrap_or(0)
    }
}
