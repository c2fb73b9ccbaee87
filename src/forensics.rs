//! Forensic analysis over simulation output.
//!
//! Everything in this module is a pure function of its inputs: detectors run
//! in declared order, findings are emitted in that order, and identical inputs
//! produce byte-identical outputs. The analyzer holds only immutable
//! reference data (the official-contract allow-list and the pluggable scam
//! registry).
//!
//! The reentrancy heuristic (one callee observed at three or more distinct
//! depths) is deliberately loose and can fire on nested proxy hops; its 0.7
//! confidence reflects that.

use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::simulator::models::{AssetChange, CallTrace, WHOLE_UNIT};
use crate::types::{IntentCategory, RiskLevel, Severity};
use crate::verdict::{dedup_findings, risk_score, AttackFinding, AttackKind};

/// Function selectors worth flagging, with their well-known names.
pub const DANGEROUS_SELECTORS: &[(&str, &str)] = &[
    ("0x095ea7b3", "approve"),
    ("0xd505accf", "permit"),
    ("0xf2fde38b", "transferOwnership"),
    ("0xa9059cbb", "transfer"),
    ("0x23b872dd", "transferFrom"),
    ("0x69d2809b", "confirmTransaction"),
    ("0x8456cb59", "submitTransaction"),
    ("0xdd62ed3e", "allowance"),
    ("0x52ef6b2c", "setSlippage"),
    ("0x5c19a95c", "delegate"),
];

/// The ERC-20 `approve(address,uint256)` selector.
pub const APPROVE_SELECTOR: &str = "0x095ea7b3";

/// 256-bit all-ones argument as it appears in calldata.
const UNLIMITED_APPROVAL_PATTERN: &str =
    "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

/// Call depth beyond which a trace is considered suspicious.
const DEEP_STACK_THRESHOLD: u32 = 20;

/// Distinct depths at which one callee must appear to look reentrant.
const REENTRANCY_DEPTHS: usize = 3;

/// Contracts allow-listed as official (lowercase addresses).
const OFFICIAL_CONTRACTS: &[&str] = &[
    // Uniswap V2 router
    "0x7a250d5630b4cf539739df2c5dacb4c659f2488d",
    // Uniswap V3 router
    "0xe592427a0aece92de3edee1f18e0157c05861564",
];

/// Native transfer observed inside the trace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeFlow {
    pub from: String,
    pub to: String,
    pub value: String,
}

/// Result of [`ForensicsAnalyzer::analyze_trace`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TraceAnalysis {
    pub summary: String,
    pub call_count: usize,
    pub max_depth: u32,
    /// Indented rendering of the first 30 frames.
    pub call_chain: Vec<String>,
    pub dangerous_calls: Vec<serde_json::Value>,
    pub native_flows: Vec<NativeFlow>,
    pub findings: Vec<AttackFinding>,
}

/// Result of [`ForensicsAnalyzer::detect_attack`] and
/// [`ForensicsAnalyzer::check_risk_patterns`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttackReport {
    pub findings: Vec<AttackFinding>,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub summary: String,
}

impl AttackReport {
    fn from_findings(findings: Vec<AttackFinding>) -> Self {
        let findings = dedup_findings(findings);
        let score = risk_score(&findings);
        let summary = if findings.is_empty() {
            "no attack patterns detected".to_string()
        } else {
            let kinds: Vec<&str> = findings.iter().map(|f| f.kind.as_str()).collect();
            format!("{} pattern(s) detected: {}", findings.len(), kinds.join(", "))
        };
        Self {
            findings,
            risk_score: score,
            risk_level: RiskLevel::from_score(score),
            summary,
        }
    }

    /// Fuse several reports into one: union of findings deduplicated by
    /// (type, detail digest) in first-seen order, score recomputed.
    #[must_use]
    pub fn fuse(reports: &[&AttackReport]) -> AttackReport {
        let merged: Vec<AttackFinding> = reports
            .iter()
            .flat_map(|r| r.findings.iter().cloned())
            .collect();
        AttackReport::from_findings(merged)
    }
}

/// Inputs describing the candidate transaction for the dynamic detectors.
#[derive(Clone, Debug)]
pub struct AttackContext<'a> {
    pub sender: &'a str,
    /// Declared transfer amount in base units; intended outflow is netted out
    /// before the phishing/drain detectors fire.
    pub declared_value: i128,
    pub intent: IntentCategory,
}

/// Pure-function analyzer over simulation output.
#[derive(Clone, Debug)]
pub struct ForensicsAnalyzer {
    official_contracts: FxHashSet<String>,
    scam_registry: FxHashSet<String>,
}

impl Default for ForensicsAnalyzer {
    fn default() -> Self {
        Self {
            official_contracts: OFFICIAL_CONTRACTS.iter().map(|s| s.to_string()).collect(),
            scam_registry: FxHashSet::default(),
        }
    }
}

impl ForensicsAnalyzer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the scam registry (lowercase addresses). The registry is
    /// in-memory only; persistence is out of scope.
    #[must_use]
    pub fn with_scam_registry<I, S>(mut self, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scam_registry = addresses.into_iter().map(|s| s.into().to_lowercase()).collect();
        self
    }

    /// Analyze the call trace: counts, depth, chain digest, and trace-derived
    /// risk findings.
    #[must_use]
    pub fn analyze_trace(
        &self,
        traces: &[CallTrace],
        _tx_from: &str,
        _tx_to: &str,
        _tx_value: &str,
    ) -> TraceAnalysis {
        if traces.is_empty() {
            return TraceAnalysis {
                summary: "no call trace".into(),
                ..TraceAnalysis::default()
            };
        }

        let call_count = traces.len();
        let max_depth = traces.iter().map(|t| t.depth).max().unwrap_or(0);
        let call_chain = render_call_chain(traces);
        let dangerous_calls = self.dangerous_calls(traces);
        let native_flows = native_flows(traces);

        let mut findings = Vec::new();
        if max_depth > DEEP_STACK_THRESHOLD {
            findings.push(
                AttackFinding::new(AttackKind::DeepCallStack, Severity::Warning, 0.6)
                    .with_detail(json!({ "max_depth": max_depth })),
            );
        }
        if let Some(candidate) = reentrancy_candidate(traces) {
            findings.push(
                AttackFinding::new(AttackKind::Reentrancy, Severity::High, 0.6).with_detail(json!({
                    "address": candidate.0,
                    "depths": candidate.1,
                })),
            );
        }
        for frame in traces {
            if frame
                .call_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("delegatecall"))
            {
                findings.push(
                    AttackFinding::new(AttackKind::DangerousSelector, Severity::High, 0.8)
                        .with_detail(json!({
                            "call_type": "delegatecall",
                            "to": frame.to_address,
                        })),
                );
            }
        }
        for call in &dangerous_calls {
            findings.push(
                AttackFinding::new(AttackKind::DangerousSelector, Severity::Warning, 0.6)
                    .with_detail(call.clone()),
            );
        }

        TraceAnalysis {
            summary: format!("{call_count} call(s), max depth {max_depth}"),
            call_count,
            max_depth,
            call_chain,
            dangerous_calls,
            native_flows,
            findings: dedup_findings(findings),
        }
    }

    /// Run the fixed dynamic detector set over traces and asset changes.
    ///
    /// Detector order is fixed: reentrancy, approval trap, phishing, drain,
    /// flashloan.
    #[must_use]
    pub fn detect_attack(
        &self,
        traces: &[CallTrace],
        asset_changes: &[AssetChange],
        ctx: &AttackContext<'_>,
    ) -> AttackReport {
        let mut findings = Vec::new();

        if let Some((address, depths)) = reentrancy_candidate(traces) {
            findings.push(
                AttackFinding::new(AttackKind::Reentrancy, Severity::Critical, 0.7).with_detail(
                    json!({
                        "address": address,
                        "depths": depths,
                    }),
                ),
            );
        }

        for frame in traces {
            if frame.selector() == Some(APPROVE_SELECTOR)
                && !self.official_contracts.contains(&frame.to_address)
            {
                findings.push(
                    AttackFinding::new(AttackKind::ApprovalTrap, Severity::Critical, 0.8)
                        .with_detail(json!({
                            "target": frame.to_address,
                            "reason": "approval toward a non-allow-listed contract",
                        })),
                );
                break;
            }
        }

        let sender_outflow: i128 = asset_changes
            .iter()
            .filter(|c| c.is_native() && c.holder == ctx.sender)
            .map(AssetChange::delta)
            .filter(|d| *d < 0)
            .sum();
        let unexplained_sender = (-sender_outflow) - ctx.declared_value.max(0);
        if unexplained_sender >= WHOLE_UNIT {
            findings.push(
                AttackFinding::new(AttackKind::Phishing, Severity::Critical, 0.6).with_detail(
                    json!({
                        "unexplained_outflow": unexplained_sender.to_string(),
                        "intent": ctx.intent.as_str(),
                    }),
                ),
            );
        }

        let total_outflow: i128 = asset_changes
            .iter()
            .filter(|c| c.is_native())
            .map(AssetChange::delta)
            .filter(|d| *d < 0)
            .sum();
        let unexplained_total = (-total_outflow) - ctx.declared_value.max(0);
        if unexplained_total >= WHOLE_UNIT {
            findings.push(
                AttackFinding::new(AttackKind::Drain, Severity::Critical, 0.7).with_detail(json!({
                    "drained_base_units": unexplained_total.to_string(),
                })),
            );
        }

        let serialized = serde_json::to_string(traces).unwrap_or_default();
        if serialized.to_lowercase().contains("flashloan") {
            findings.push(
                AttackFinding::new(AttackKind::Flashloan, Severity::Warning, 0.8)
                    .with_detail(json!({ "marker": "flashloan" })),
            );
        }

        AttackReport::from_findings(findings)
    }

    /// Static risk patterns over the candidate call itself: selector table,
    /// unlimited-approval constant, scam registry, and (when a trace is
    /// available) extreme call depth.
    #[must_use]
    pub fn check_risk_patterns(
        &self,
        tx_to: &str,
        tx_data: &str,
        traces: Option<&[CallTrace]>,
    ) -> AttackReport {
        let mut findings = Vec::new();
        let data = tx_data.to_lowercase();

        if let Some(selector) = extract_selector(&data) {
            if let Some((_, name)) = DANGEROUS_SELECTORS.iter().find(|(s, _)| *s == selector) {
                findings.push(
                    AttackFinding::new(AttackKind::DangerousSelector, Severity::Warning, 0.9)
                        .with_detail(json!({
                            "selector": selector,
                            "function": name,
                        })),
                );
            }
        }

        if data.contains(UNLIMITED_APPROVAL_PATTERN) {
            findings.push(
                AttackFinding::new(AttackKind::UnlimitedApproval, Severity::High, 0.95)
                    .with_detail(json!({ "pattern": "uint256 max" })),
            );
        }

        if self.scam_registry.contains(&tx_to.to_lowercase()) {
            findings.push(
                AttackFinding::new(AttackKind::ScamContract, Severity::Critical, 0.95)
                    .with_detail(json!({ "address": tx_to })),
            );
        }

        if let Some(traces) = traces {
            let max_depth = traces.iter().map(|t| t.depth).max().unwrap_or(0);
            if max_depth > 30 {
                findings.push(
                    AttackFinding::new(AttackKind::DeepCallStack, Severity::Warning, 0.6)
                        .with_detail(json!({ "max_depth": max_depth })),
                );
            }
        }

        AttackReport::from_findings(findings)
    }

    fn dangerous_calls(&self, traces: &[CallTrace]) -> Vec<serde_json::Value> {
        let mut calls = Vec::new();
        for frame in traces {
            if let Some(selector) = frame.selector() {
                if let Some((_, name)) = DANGEROUS_SELECTORS.iter().find(|(s, _)| *s == selector) {
                    calls.push(json!({
                        "selector": selector,
                        "function": name,
                        "from": short(&frame.from_address),
                        "to": short(&frame.to_address),
                    }));
                }
            }
        }
        calls
    }
}

/// First four bytes of the calldata as a `0x`-prefixed selector.
#[must_use]
pub fn extract_selector(data: &str) -> Option<String> {
    (data.len() >= 10 && data.starts_with("0x")).then(|| data[..10].to_lowercase())
}

fn short(address: &str) -> String {
    address.chars().take(10).collect()
}

fn render_call_chain(traces: &[CallTrace]) -> Vec<String> {
    traces
        .iter()
        .take(30)
        .map(|t| {
            format!(
                "{}{} -> {}",
                "  ".repeat(t.depth as usize),
                short(&t.from_address),
                short(&t.to_address),
            )
        })
        .collect()
}

fn native_flows(traces: &[CallTrace]) -> Vec<NativeFlow> {
    traces
        .iter()
        .filter(|t| parse_quantity(&t.value) > 0)
        .map(|t| NativeFlow {
            from: short(&t.from_address),
            to: short(&t.to_address),
            value: t.value.clone(),
        })
        .collect()
}

fn parse_quantity(value: &str) -> i128 {
    if let Some(hex_part) = value.strip_prefix("0x") {
        i128::from_str_radix(hex_part, 16).unwrap_or(0)
    } else {
        value.parse().unwrap_or(0)
    }
}

/// The first callee observed at [`REENTRANCY_DEPTHS`] or more distinct depths,
/// with the depths it was seen at. Iteration order over callees is the order
/// of their first appearance, keeping the result deterministic.
fn reentrancy_candidate(traces: &[CallTrace]) -> Option<(String, Vec<u32>)> {
    let mut order: Vec<&str> = Vec::new();
    let mut depths_by_callee: FxHashMap<&str, Vec<u32>> = FxHashMap::default();
    for frame in traces {
        if frame.to_address.is_empty() {
            continue;
        }
        let entry = depths_by_callee.entry(frame.to_address.as_str()).or_default();
        if entry.is_empty() {
            order.push(frame.to_address.as_str());
        }
        if !entry.contains(&frame.depth) {
            entry.push(frame.depth);
        }
    }
    for callee in order {
        let depths = &depths_by_callee[callee];
        if depths.len() >= REENTRANCY_DEPTHS {
            return Some((callee.to_string(), depths.clone()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::models::NATIVE_ASSET;

    fn frame(depth: u32, to: &str, input: &str) -> CallTrace {
        CallTrace {
            depth,
            from_address: "0x1111111111111111111111111111111111111111".into(),
            to_address: to.into(),
            value: "0".into(),
            input_data: input.into(),
            ..CallTrace::default()
        }
    }

    fn native_change(holder: &str, delta: i128) -> AssetChange {
        AssetChange {
            holder: holder.into(),
            token_address: NATIVE_ASSET.into(),
            token_symbol: "ETH".into(),
            token_decimals: 18,
            balance_before: "0".into(),
            balance_after: "0".into(),
            change_amount: delta.to_string(),
        }
    }

    fn ctx(declared: i128) -> AttackContext<'static> {
        AttackContext {
            sender: "0x1111111111111111111111111111111111111111",
            declared_value: declared,
            intent: IntentCategory::Swap,
        }
    }

    const TARGET: &str = "0xdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef";

    #[test]
    fn depth_twenty_is_quiet_twenty_one_flags() {
        let analyzer = ForensicsAnalyzer::new();
        let quiet: Vec<CallTrace> = (0..=20).map(|d| frame(d, TARGET, "0x")).collect();
        let analysis = analyzer.analyze_trace(&quiet, "0x", "0x", "0");
        assert_eq!(analysis.max_depth, 20);
        assert!(analysis
            .findings
            .iter()
            .all(|f| f.kind != AttackKind::DeepCallStack));

        let deep: Vec<CallTrace> = (0..=21).map(|d| frame(d, TARGET, "0x")).collect();
        let analysis = analyzer.analyze_trace(&deep, "0x", "0x", "0");
        assert!(analysis
            .findings
            .iter()
            .any(|f| f.kind == AttackKind::DeepCallStack));
    }

    #[test]
    fn reentrancy_needs_three_distinct_depths() {
        let two = vec![frame(1, TARGET, "0x"), frame(5, TARGET, "0x")];
        assert!(reentrancy_candidate(&two).is_none());

        let three = vec![
            frame(1, TARGET, "0x"),
            frame(5, TARGET, "0x"),
            frame(9, TARGET, "0x"),
        ];
        let (address, depths) = reentrancy_candidate(&three).unwrap();
        assert_eq!(address, TARGET);
        assert_eq!(depths, vec![1, 5, 9]);
    }

    #[test]
    fn approval_trap_fires_off_allowlist_only() {
        let analyzer = ForensicsAnalyzer::new();
        let data = format!("0x095ea7b3{}", "0".repeat(64));

        let trap = vec![frame(0, TARGET, &data)];
        let report = analyzer.detect_attack(&trap, &[], &ctx(0));
        assert!(report
            .findings
            .iter()
            .any(|f| f.kind == AttackKind::ApprovalTrap));

        let official = vec![frame(
            0,
            "0xe592427a0aece92de3edee1f18e0157c05861564",
            &data,
        )];
        let report = analyzer.detect_attack(&official, &[], &ctx(0));
        assert!(report
            .findings
            .iter()
            .all(|f| f.kind != AttackKind::ApprovalTrap));
    }

    #[test]
    fn intended_swap_outflow_is_not_drain_or_phishing() {
        let analyzer = ForensicsAnalyzer::new();
        let changes = vec![
            native_change("0x1111111111111111111111111111111111111111", -WHOLE_UNIT),
            native_change(TARGET, WHOLE_UNIT),
        ];
        let report = analyzer.detect_attack(&[], &changes, &ctx(WHOLE_UNIT));
        assert!(report.findings.is_empty());
        assert_eq!(report.risk_level, RiskLevel::Safe);
    }

    #[test]
    fn unexplained_outflow_is_drain_and_phishing() {
        let analyzer = ForensicsAnalyzer::new();
        let changes = vec![native_change(
            "0x1111111111111111111111111111111111111111",
            -2 * WHOLE_UNIT,
        )];
        let report = analyzer.detect_attack(&[], &changes, &ctx(0));
        let kinds: Vec<AttackKind> = report.findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&AttackKind::Phishing));
        assert!(kinds.contains(&AttackKind::Drain));
    }

    #[test]
    fn flashloan_marker_in_trace() {
        let analyzer = ForensicsAnalyzer::new();
        let traces = vec![frame(1, TARGET, "0xdeadbeef00flashloan")];
        // Input is not valid hex, but the detector scans the serialized form.
        let report = analyzer.detect_attack(&traces, &[], &ctx(0));
        assert!(report
            .findings
            .iter()
            .any(|f| f.kind == AttackKind::Flashloan));
    }

    #[test]
    fn unlimited_approval_constant() {
        let analyzer = ForensicsAnalyzer::new();
        let data = format!("0x095ea7b3{}{}", "0".repeat(64), "f".repeat(64));
        let report = analyzer.check_risk_patterns(TARGET, &data, None);
        let kinds: Vec<AttackKind> = report.findings.iter().map(|f| f.kind).collect();
        assert!(kinds.contains(&AttackKind::DangerousSelector));
        assert!(kinds.contains(&AttackKind::UnlimitedApproval));
    }

    #[test]
    fn scam_registry_hit_is_critical() {
        let analyzer = ForensicsAnalyzer::new().with_scam_registry([TARGET]);
        let report = analyzer.check_risk_patterns(TARGET, "0x", None);
        assert!(report
            .findings
            .iter()
            .any(|f| f.kind == AttackKind::ScamContract && f.severity == Severity::Critical));
    }

    #[test]
    fn fused_report_reaches_critical_for_unlimited_approval_trap() {
        let analyzer = ForensicsAnalyzer::new();
        let data = format!("0x095ea7b3{}{}", "0".repeat(64), "f".repeat(64));
        let static_report = analyzer.check_risk_patterns(TARGET, &data, None);
        let traces = vec![frame(0, TARGET, &data)];
        let dynamic = analyzer.detect_attack(&traces, &[], &ctx(0));
        let fused = AttackReport::fuse(&[&static_report, &dynamic]);
        assert!(fused.risk_score >= 0.7, "score {}", fused.risk_score);
        assert_eq!(fused.risk_level, RiskLevel::Critical);
    }

    #[test]
    fn determinism_identical_inputs_identical_outputs() {
        let analyzer = ForensicsAnalyzer::new();
        let traces = vec![
            frame(1, TARGET, "0x095ea7b300"),
            frame(5, TARGET, "0x"),
            frame(9, TARGET, "0x"),
        ];
        let changes = vec![native_change(
            "0x1111111111111111111111111111111111111111",
            -3 * WHOLE_UNIT,
        )];
        let a = analyzer.detect_attack(&traces, &changes, &ctx(0));
        let b = analyzer.detect_attack(&traces, &changes, &ctx(0));
        assert_eq!(
            serde_json::to_string(&a.findings).unwrap(),
            serde_json::to_string(&b.findings).unwrap()
        );
        assert_eq!(a.risk_score, b.risk_score);
    }
}
