//! Final verdict types: findings, evidence, and the aggregated report.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::simulator::models::AssetChange;
use crate::types::{RiskLevel, Severity};

/// Attack pattern type tags. Closed set; detectors never invent new tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttackKind {
    Reentrancy,
    ApprovalTrap,
    Phishing,
    Drain,
    Flashloan,
    UnlimitedApproval,
    ScamContract,
    DeepCallStack,
    DangerousSelector,
}

impl AttackKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            AttackKind::Reentrancy => "reentrancy",
            AttackKind::ApprovalTrap => "approval_trap",
            AttackKind::Phishing => "phishing",
            AttackKind::Drain => "drain",
            AttackKind::Flashloan => "flashloan",
            AttackKind::UnlimitedApproval => "unlimited_approval",
            AttackKind::ScamContract => "scam_contract",
            AttackKind::DeepCallStack => "deep_call_stack",
            AttackKind::DangerousSelector => "dangerous_selector",
        }
    }
}

/// A single detector's conclusion about one attack pattern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttackFinding {
    #[serde(rename = "type")]
    pub kind: AttackKind,
    pub severity: Severity,
    /// Detector confidence in `[0, 1]`.
    pub confidence: f64,
    /// Free-form supporting detail.
    pub detail: serde_json::Value,
}

impl AttackFinding {
    #[must_use]
    pub fn new(kind: AttackKind, severity: Severity, confidence: f64) -> Self {
        Self {
            kind,
            severity,
            confidence,
            detail: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }

    /// Contribution of this finding to the overall risk score.
    #[must_use]
    pub fn score(&self) -> f64 {
        self.severity.weight() * self.confidence
    }

    /// Deduplication key: type tag plus a digest of the detail payload.
    /// serde_json maps are key-sorted, so equal details digest equally.
    #[must_use]
    pub fn dedup_key(&self) -> (AttackKind, String) {
        let serialized = serde_json::to_vec(&self.detail).unwrap_or_default();
        let digest = hex::encode(Sha256::digest(&serialized));
        (self.kind, digest)
    }
}

/// Severity-weighted risk score over a finding set, capped at 1.0.
#[must_use]
pub fn risk_score(findings: &[AttackFinding]) -> f64 {
    findings.iter().map(AttackFinding::score).sum::<f64>().min(1.0)
}

/// Deduplicate findings by (type, detail digest), preserving first-seen order.
#[must_use]
pub fn dedup_findings(findings: Vec<AttackFinding>) -> Vec<AttackFinding> {
    let mut seen = rustc_hash::FxHashSet::default();
    findings
        .into_iter()
        .filter(|f| seen.insert(f.dedup_key()))
        .collect()
}

/// Evidence bundle attached to a verdict.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Evidence {
    /// At most the first five asset changes.
    pub asset_changes: Vec<AssetChange>,
    pub call_count: usize,
    pub max_call_depth: u32,
    /// Short indented rendering of the call chain.
    pub call_chain: Vec<String>,
    /// Digests of emitted events (`address topic0`).
    pub event_digests: Vec<String>,
}

/// Echo of the audited transaction.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransactionEcho {
    pub from: String,
    pub to: String,
    pub value: String,
    pub data_preview: String,
}

/// One verdict finding: either a detector pattern or a free-text note from
/// anomaly detection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VerdictFinding {
    Pattern(AttackFinding),
    Note(String),
}

impl VerdictFinding {
    /// The pattern finding, when this is one.
    #[must_use]
    pub fn as_pattern(&self) -> Option<&AttackFinding> {
        match self {
            VerdictFinding::Pattern(finding) => Some(finding),
            VerdictFinding::Note(_) => None,
        }
    }
}

/// The aggregated audit verdict returned to the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verdict {
    pub risk_level: RiskLevel,
    /// Confidence in `[0, 1]`, carried over from reflection.
    pub confidence: f64,
    /// Risk score in `[0, 1]`, the maximum across contributors.
    pub risk_score: f64,
    pub summary: String,
    pub findings: Vec<VerdictFinding>,
    pub recommendations: Vec<String>,
    pub evidence: Evidence,
    pub transaction: TransactionEcho,
    /// Stage names that ran, in order.
    pub execution_history: Vec<String>,
}

impl Verdict {
    /// Integer risk score in `0..=100` for transport metadata.
    #[must_use]
    pub fn risk_score_percent(&self) -> u32 {
        (self.risk_score.clamp(0.0, 1.0) * 100.0).round() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn score_is_capped() {
        let findings = vec![
            AttackFinding::new(AttackKind::Reentrancy, Severity::Critical, 1.0),
            AttackFinding::new(AttackKind::Drain, Severity::Critical, 1.0),
            AttackFinding::new(AttackKind::Phishing, Severity::Critical, 1.0),
        ];
        assert_eq!(risk_score(&findings), 1.0);
    }

    #[test]
    fn dedup_preserves_first_seen_order() {
        let a = AttackFinding::new(AttackKind::Drain, Severity::Critical, 0.7)
            .with_detail(json!({"amount": 2}));
        let b = AttackFinding::new(AttackKind::Reentrancy, Severity::Critical, 0.7);
        let duplicate = a.clone();
        let out = dedup_findings(vec![a.clone(), b.clone(), duplicate]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind, AttackKind::Drain);
        assert_eq!(out[1].kind, AttackKind::Reentrancy);
    }

    #[test]
    fn same_kind_different_detail_survives_dedup() {
        let a = AttackFinding::new(AttackKind::DangerousSelector, Severity::Warning, 0.9)
            .with_detail(json!({"selector": "0x095ea7b3"}));
        let b = AttackFinding::new(AttackKind::DangerousSelector, Severity::Warning, 0.9)
            .with_detail(json!({"selector": "0xa9059cbb"}));
        assert_eq!(dedup_findings(vec![a, b]).len(), 2);
    }

    #[test]
    fn percent_rendering() {
        let verdict = Verdict {
            risk_level: RiskLevel::Warning,
            confidence: 0.7,
            risk_score: 0.435,
            summary: String::new(),
            findings: vec![],
            recommendations: vec![],
            evidence: Evidence::default(),
            transaction: TransactionEcho::default(),
            execution_history: vec![],
        };
        assert_eq!(verdict.risk_score_percent(), 44);
    }

    #[test]
    fn attack_kind_serde_tags() {
        let json = serde_json::to_string(&AttackKind::ApprovalTrap).unwrap();
        assert_eq!(json, r#""approval_trap""#);
    }
}
