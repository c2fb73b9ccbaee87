//! The audit context threaded through every pipeline stage.
//!
//! [`AuditContext`] is exclusively owned by one pipeline invocation: it is
//! created at request entry, mutated stage by stage, and discarded once the
//! response is produced. Stage outputs live in dedicated typed slots — one
//! struct per stage — so downstream stages read exactly the shape they expect
//! instead of digging through a string-keyed bag.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::AuditConfig;
use crate::forensics::{AttackReport, TraceAnalysis};
use crate::simulator::models::{SimulationRequest, SimulationResult};
use crate::types::{Complexity, IntentCategory, RiskLevel, Severity, StageName, TaskPriority};

/// Raw, unvalidated transaction fields as they arrive at the transport.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawTransaction {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    pub tx_from: String,
    pub tx_to: String,
    /// Accepts decimal strings, hex strings, integers, or floats (whole
    /// units); perception normalizes to a canonical decimal string.
    #[serde(default)]
    pub tx_value: serde_json::Value,
    #[serde(default)]
    pub tx_data: Option<String>,
    #[serde(default)]
    pub gas_limit: Option<u64>,
    #[serde(default)]
    pub fork_block: Option<u64>,
}

fn default_chain_id() -> u64 {
    1
}

/// Structured reading of the user's natural-language intent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParsedIntent {
    #[serde(default = "default_category")]
    pub category: IntentCategory,
    /// Numeric amounts mentioned in the intent text, in order.
    pub amounts: Vec<String>,
    /// Slippage tolerance as a fraction (0.005 for "0.5%"), when stated.
    pub slippage_tolerance: Option<f64>,
    pub raw: String,
}

fn default_category() -> IntentCategory {
    IntentCategory::Unknown
}

/// Output of the perception stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PerceptionOutput {
    pub intent: ParsedIntent,
    /// The validated, normalized transaction.
    pub request: SimulationRequest,
    pub complexity: Complexity,
    /// Non-fatal normalizations applied silently.
    pub warnings: Vec<String>,
}

/// Canonical plan task identifiers. Closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskId {
    StaticAnalysis,
    SetupEnvironment,
    SimulateTx,
    TraceAnalysis,
    AttackDetection,
}

impl TaskId {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskId::StaticAnalysis => "static_analysis",
            TaskId::SetupEnvironment => "setup_environment",
            TaskId::SimulateTx => "simulate_tx",
            TaskId::TraceAnalysis => "trace_analysis",
            TaskId::AttackDetection => "attack_detection",
        }
    }
}

/// Closed dispatch table of capability invocations. Replaces action-name
/// string routing: an unknown (capability, action) pair is unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityAction {
    SimulatorStart,
    SimulatorSimulate,
    ForensicsAnalyzeTrace,
    ForensicsDetectAttack,
    ForensicsCheckRiskPatterns,
}

impl CapabilityAction {
    /// The owning capability's name, for diagnostics.
    #[must_use]
    pub fn capability(&self) -> &'static str {
        match self {
            CapabilityAction::SimulatorStart | CapabilityAction::SimulatorSimulate => "simulator",
            _ => "forensics",
        }
    }
}

/// One node of the execution plan DAG.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanTask {
    pub id: TaskId,
    pub action: CapabilityAction,
    pub priority: TaskPriority,
    pub depends_on: Vec<TaskId>,
}

/// Output of the planner stage: topologically ordered tasks plus their
/// parallel grouping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlanOutput {
    /// Tasks in execution order.
    pub tasks: Vec<PlanTask>,
    /// Task ids grouped into levels; every task in a level may run
    /// concurrently with its siblings.
    pub parallel_groups: Vec<Vec<TaskId>>,
    /// Set when ordering had to tie-break an unsatisfiable dependency.
    pub warnings: Vec<String>,
}

/// Outcome of one invoked task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// Classification of an execution failure, driving the retry decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    ExecutionError,
    Other,
}

/// Output of the executor stage.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub outcomes: Vec<TaskOutcome>,
    /// True when more than half of the invoked tasks succeeded.
    pub overall_success: bool,
    pub trace_analysis: Option<TraceAnalysis>,
    /// Fused static + dynamic attack report.
    pub attack_report: Option<AttackReport>,
    /// Failure classifications for reflection.
    pub failures: Vec<FailureKind>,
}

/// A reflection-detected anomaly on top of the simulator's own list.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: String,
    pub severity: Severity,
    pub message: String,
}

/// Strategy chosen for an executor re-run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryStrategy {
    IncreaseTimeout { multiplier: u32 },
    StateOverride { strategies: Vec<String> },
    SimpleRetry,
}

/// Output of the reflection stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReflectionOutput {
    pub overall_success: bool,
    pub confidence: f64,
    pub issues: Vec<String>,
    pub anomalies: Vec<Anomaly>,
    /// Risk level as upgraded by reflection (fused with the detector level by
    /// the aggregator).
    pub upgraded_level: RiskLevel,
    pub should_retry: bool,
    pub strategy: Option<RetryStrategy>,
    pub improvements: Vec<String>,
}

/// Mutable record threaded through one audit.
#[derive(Clone, Debug)]
pub struct AuditContext {
    pub user_intent: String,
    pub raw_tx: RawTransaction,
    /// Immutable configuration snapshot; read-only after perception.
    pub config: Arc<AuditConfig>,

    pub perception: Option<PerceptionOutput>,
    pub plan: Option<PlanOutput>,
    pub execution: Option<ExecutionOutput>,
    pub reflection: Option<ReflectionOutput>,
    /// Dedicated slot for the aggregated simulation result so downstream
    /// stages need not walk the executor output.
    pub simulation: Option<SimulationResult>,
    /// The final verdict, written by the aggregator.
    pub verdict: Option<crate::verdict::Verdict>,

    /// Stage names that have run, in order.
    pub history: Vec<StageName>,
    pub retry_count: u32,
}

impl AuditContext {
    #[must_use]
    pub fn new(user_intent: impl Into<String>, raw_tx: RawTransaction, config: Arc<AuditConfig>) -> Self {
        Self {
            user_intent: user_intent.into(),
            raw_tx,
            config,
            perception: None,
            plan: None,
            execution: None,
            reflection: None,
            simulation: None,
            verdict: None,
            history: Vec::new(),
            retry_count: 0,
        }
    }

    /// Record a completed stage in the execution history.
    pub fn record_stage(&mut self, stage: StageName) {
        self.history.push(stage);
    }

    /// The normalized request. `None` until perception has run.
    #[must_use]
    pub fn request(&self) -> Option<&SimulationRequest> {
        self.perception.as_ref().map(|p| &p.request)
    }

    /// History rendered as stage-name strings for reports.
    #[must_use]
    pub fn history_strings(&self) -> Vec<String> {
        self.history.iter().map(|s| s.as_str().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_records_in_order() {
        let mut ctx = AuditContext::new(
            "swap",
            RawTransaction::default(),
            Arc::new(AuditConfig::default()),
        );
        ctx.record_stage(StageName::Perception);
        ctx.record_stage(StageName::Executor);
        assert_eq!(ctx.history_strings(), vec!["perception", "executor"]);
    }

    #[test]
    fn raw_transaction_accepts_mixed_value_forms() {
        let json = serde_json::json!({
            "tx_from": "0x1111111111111111111111111111111111111111",
            "tx_to": "0x2222222222222222222222222222222222222222",
            "tx_value": 1.5,
        });
        let raw: RawTransaction = serde_json::from_value(json).unwrap();
        assert_eq!(raw.chain_id, 1);
        assert!(raw.tx_value.is_f64());
        assert!(raw.tx_data.is_none());
    }

    #[test]
    fn capability_action_names() {
        assert_eq!(CapabilityAction::SimulatorSimulate.capability(), "simulator");
        assert_eq!(
            CapabilityAction::ForensicsDetectAttack.capability(),
            "forensics"
        );
    }
}
