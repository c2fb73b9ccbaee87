//! Aggregator: fuse every prior output into the final verdict.

use async_trait::async_trait;

use crate::config::ReasoningEngine;
use crate::context::AuditContext;
use crate::reasoning::OracleInput;
use crate::stage::{Stage, StageEnv, StageError, StageReport};
use crate::types::{IntentCategory, NextStep, RiskLevel, Severity, StageName};
use crate::verdict::{
    dedup_findings, Evidence, TransactionEcho, Verdict, VerdictFinding,
};

pub struct AggregatorStage;

#[async_trait]
impl Stage for AggregatorStage {
    fn name(&self) -> StageName {
        StageName::Aggregator
    }

    async fn run(
        &self,
        ctx: &mut AuditContext,
        env: &StageEnv,
    ) -> Result<StageReport, StageError> {
        let attack = ctx
            .execution
            .as_ref()
            .and_then(|e| e.attack_report.as_ref());
        let reflection = ctx.reflection.as_ref();

        // Risk level is the maximum of the contributors; the score follows.
        let attack_level = attack.map(|r| r.risk_level).unwrap_or(RiskLevel::Safe);
        let reflection_level = reflection
            .map(|r| r.upgraded_level)
            .unwrap_or(RiskLevel::Safe);
        let risk_level = attack_level.max(reflection_level);

        let attack_score = attack.map(|r| r.risk_score).unwrap_or(0.0);
        let anomaly_score = reflection
            .is_some_and(|r| r.anomalies.iter().any(|a| a.severity == Severity::Critical))
            .then_some(0.9)
            .unwrap_or(0.0);
        let risk_score = attack_score.max(anomaly_score);

        let mut confidence = reflection.map(|r| r.confidence).unwrap_or(0.7);

        // Findings: critical anomalies first, then rule findings, deduplicated.
        let mut findings: Vec<VerdictFinding> = Vec::new();
        if let Some(reflection) = reflection {
            findings.extend(
                reflection
                    .anomalies
                    .iter()
                    .filter(|a| a.severity == Severity::Critical)
                    .map(|a| VerdictFinding::Note(a.message.clone())),
            );
        }
        if let Some(attack) = attack {
            findings.extend(
                dedup_findings(attack.findings.clone())
                    .into_iter()
                    .map(VerdictFinding::Pattern),
            );
        }

        let mut recommendations = recommendations_for(risk_level);
        if let Some(reflection) = reflection {
            recommendations.extend(reflection.improvements.iter().cloned());
        }

        // Advisory model opinion; never changes the rule-derived level.
        if ctx.config.reasoning.engine != ReasoningEngine::RulesOnly {
            let input = OracleInput {
                intent: ctx.user_intent.clone(),
                category: ctx
                    .perception
                    .as_ref()
                    .map(|p| p.intent.category)
                    .unwrap_or(IntentCategory::Unknown),
                risk_level,
                risk_score,
                finding_kinds: findings
                    .iter()
                    .filter_map(VerdictFinding::as_pattern)
                    .map(|f| f.kind.as_str().to_string())
                    .collect(),
            };
            if let Ok(opinion) = env.capabilities.oracle.assess(&input).await {
                confidence =
                    (confidence + opinion.confidence_adjustment.clamp(-0.1, 0.1)).clamp(0.0, 1.0);
                if let Some(note) = opinion.note {
                    recommendations.push(note);
                }
            }
        }

        let simulation_failed = ctx
            .simulation
            .as_ref()
            .map(|s| !s.success)
            .unwrap_or(false);
        let summary = summary_for(risk_level, confidence, simulation_failed);

        let verdict = Verdict {
            risk_level,
            confidence,
            risk_score,
            summary,
            findings,
            recommendations,
            evidence: build_evidence(ctx),
            transaction: transaction_echo(ctx),
            execution_history: ctx.history_strings(),
        };

        env.emit(
            StageName::Aggregator,
            "verdict",
            format!(
                "{} score={:.2} confidence={:.2}",
                verdict.risk_level, verdict.risk_score, verdict.confidence
            ),
        );
        ctx.verdict = Some(verdict);
        Ok(StageReport::ok(confidence, NextStep::Done))
    }
}

/// Fixed recommendation template per risk level.
fn recommendations_for(level: RiskLevel) -> Vec<String> {
    match level {
        RiskLevel::Critical => vec![
            "stop this transaction immediately".into(),
            "verify the target contract address".into(),
            "check the calldata for tampering".into(),
            "escalate for manual review".into(),
        ],
        RiskLevel::Warning => vec![
            "proceed with caution".into(),
            "make sure every flagged risk is understood".into(),
            "consider reducing the transaction amount".into(),
        ],
        RiskLevel::Safe => vec![
            "security assessment passed".into(),
            "safe to proceed".into(),
        ],
    }
}

/// One-sentence summary keyed by risk level; names the execution failure when
/// the simulated transaction did not succeed.
fn summary_for(level: RiskLevel, confidence: f64, simulation_failed: bool) -> String {
    let base = match level {
        RiskLevel::Safe => "Transaction passed the security assessment",
        RiskLevel::Warning => "Potential risk detected",
        RiskLevel::Critical => "Serious security risk detected",
    };
    let failure_clause = if simulation_failed {
        "; transaction execution failed in simulation"
    } else {
        ""
    };
    format!(
        "{base}{failure_clause} (confidence: {:.0}%)",
        confidence * 100.0
    )
}

fn build_evidence(ctx: &AuditContext) -> Evidence {
    let mut evidence = Evidence::default();
    let Some(result) = &ctx.simulation else {
        return evidence;
    };

    evidence.asset_changes = result.asset_changes.iter().take(5).cloned().collect();
    evidence.call_count = result.call_traces.len();
    evidence.max_call_depth = result.max_call_depth();
    evidence.call_chain = ctx
        .execution
        .as_ref()
        .and_then(|e| e.trace_analysis.as_ref())
        .map(|t| t.call_chain.iter().take(10).cloned().collect())
        .unwrap_or_default();
    evidence.event_digests = result
        .events
        .iter()
        .take(10)
        .map(|e| {
            format!(
                "{} {}",
                e.address,
                e.topics.first().map(String::as_str).unwrap_or("")
            )
        })
        .collect();
    evidence
}

fn transaction_echo(ctx: &AuditContext) -> TransactionEcho {
    let Some(request) = ctx.request() else {
        return TransactionEcho::default();
    };
    let preview: String = request.tx_data.chars().take(100).collect();
    let truncated = request.tx_data.len() > 100;
    TransactionEcho {
        from: request.tx_from.clone(),
        to: request.tx_to.clone(),
        value: request.tx_value.clone(),
        data_preview: if truncated {
            format!("{preview}...")
        } else {
            preview
        },
    }
}
