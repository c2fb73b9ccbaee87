//! # txsentry: intent-aware transaction auditing
//!
//! txsentry audits a candidate EVM transaction against the user's stated
//! intent and returns a SAFE / WARNING / CRITICAL verdict with supporting
//! evidence and a tamper-evident attestation. It is called by other
//! autonomous agents over a chat-completion-compatible HTTP surface that
//! advertises the `simulate_tx` tool.
//!
//! ## Architecture
//!
//! The core is a staged analysis pipeline over a shared audit context:
//!
//! - **Perception** normalizes the intent and transaction and classifies
//!   complexity
//! - **Planner** (conditional) builds a DAG of capability invocations
//! - **Executor** drives the providers — forked simulator, forensic
//!   analyzers — either through a fixed fast path or by walking the plan's
//!   parallel groups
//! - **Reflection** scores the pass and may schedule one bounded retry
//! - **Aggregator** fuses everything into the final [`verdict::Verdict`]
//!
//! Capability providers sit behind trait seams: [`simulator::Simulator`]
//! forks upstream state into a disposable child node (snapshot, impersonate,
//! execute, revert), [`forensics::ForensicsAnalyzer`] is a pure detector
//! library, and [`isolation::IsolationManager`] owns the isolated execution
//! environment and its ephemeral keys. The transport issues the
//! [`attestation`] bundle after the verdict is final.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use txsentry::config::AuditConfig;
//! use txsentry::context::RawTransaction;
//! use txsentry::pipeline::{AuditPipeline, CancelToken};
//!
//! # async fn example() {
//! let config = Arc::new(AuditConfig::default());
//! let pipeline = AuditPipeline::new(Arc::clone(&config));
//!
//! let raw = RawTransaction {
//!     chain_id: 1,
//!     tx_from: "0x1111111111111111111111111111111111111111".into(),
//!     tx_to: "0xe592427a0aece92de3edee1f18e0157c05861564".into(),
//!     tx_value: serde_json::json!("1000000000000000000"),
//!     tx_data: Some("0x414bf389".into()),
//!     gas_limit: None,
//!     fork_block: None,
//! };
//!
//! match pipeline
//!     .run("Swap 1 ETH to USDC, slippage 0.5%", raw, CancelToken::new())
//!     .await
//! {
//!     Ok(verdict) => println!("{}: {}", verdict.risk_level, verdict.summary),
//!     Err(failure) => eprintln!("audit failed: {failure}"),
//! }
//! # }
//! ```

pub mod attestation;
pub mod config;
pub mod context;
pub mod events;
pub mod forensics;
pub mod isolation;
pub mod pipeline;
pub mod reasoning;
pub mod server;
pub mod simulator;
pub mod stage;
pub mod stages;
pub mod types;
pub mod verdict;
