//! Reflection: score the execution pass and decide whether to retry.

use async_trait::async_trait;

use crate::context::{
    Anomaly, AuditContext, FailureKind, ReflectionOutput, RetryStrategy,
};
use crate::simulator::models::WHOLE_UNIT;
use crate::stage::{Stage, StageEnv, StageError, StageReport};
use crate::types::{IntentCategory, NextStep, RiskLevel, Severity, StageName};

pub struct ReflectionStage;

#[async_trait]
impl Stage for ReflectionStage {
    fn name(&self) -> StageName {
        StageName::Reflection
    }

    async fn run(
        &self,
        ctx: &mut AuditContext,
        env: &StageEnv,
    ) -> Result<StageReport, StageError> {
        let assessment = assess_quality(ctx);
        let anomalies = detect_anomalies(ctx);
        let upgraded_level = upgrade_level(&assessment, &anomalies);

        let failures: Vec<FailureKind> = ctx
            .execution
            .as_ref()
            .map(|e| e.failures.clone())
            .unwrap_or_default();
        let (should_retry, strategy) = retry_decision(ctx, &assessment, &failures);
        let improvements = improvements(ctx, &failures);

        env.emit(
            StageName::Reflection,
            "verdict",
            format!(
                "success={} confidence={:.2} retry={}",
                assessment.overall_success, assessment.confidence, should_retry
            ),
        );

        let next = if should_retry {
            ctx.retry_count += 1;
            NextStep::Executor
        } else {
            NextStep::Aggregator
        };

        ctx.reflection = Some(ReflectionOutput {
            overall_success: assessment.overall_success,
            confidence: assessment.confidence,
            issues: assessment.issues,
            anomalies,
            upgraded_level,
            should_retry,
            strategy,
            improvements,
        });

        let report = if should_retry || ctx.reflection.as_ref().is_some_and(|r| r.overall_success) {
            StageReport::ok(assessment.confidence, next)
        } else {
            StageReport::degraded(assessment.confidence, next)
        };
        Ok(report)
    }
}

struct QualityAssessment {
    overall_success: bool,
    confidence: f64,
    issues: Vec<String>,
}

/// Quality scoring per the fixed rules: 0.7 baseline, 0.3 on simulation
/// failure, 0.9 when the fused attack score exceeds 0.7 (high risk, but the
/// signal is unambiguous).
fn assess_quality(ctx: &AuditContext) -> QualityAssessment {
    let mut assessment = QualityAssessment {
        overall_success: true,
        confidence: 0.7,
        issues: Vec::new(),
    };

    match &ctx.simulation {
        None => {
            assessment.overall_success = false;
            assessment.confidence = 0.3;
            assessment.issues.push("simulation result missing".into());
        }
        Some(result) if !result.success => {
            assessment.overall_success = false;
            assessment.confidence = 0.3;
            assessment.issues.push(format!(
                "transaction simulation failed: {}",
                result.error_message.as_deref().unwrap_or("unknown error")
            ));
        }
        Some(_) => {}
    }

    let attack_score = ctx
        .execution
        .as_ref()
        .and_then(|e| e.attack_report.as_ref())
        .map(|r| r.risk_score)
        .unwrap_or(0.0);
    if attack_score > 0.7 {
        assessment.confidence = 0.9;
    }

    assessment
}

/// Anomaly detection on top of the simulator's own rules.
fn detect_anomalies(ctx: &AuditContext) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    let Some(result) = &ctx.simulation else {
        return anomalies;
    };

    if !result.success {
        anomalies.push(Anomaly {
            kind: "transaction_failure".into(),
            severity: Severity::High,
            message: result
                .error_message
                .clone()
                .unwrap_or_else(|| "transaction execution failed".into()),
        });
    }

    let outflow = -result.sender_native_delta();
    let unexplained = outflow - result.declared_value().max(0);
    if unexplained >= WHOLE_UNIT {
        anomalies.push(Anomaly {
            kind: "unexpected_outflow".into(),
            severity: Severity::Critical,
            message: format!(
                "unexpected outflow of {:.4} native units beyond the declared value",
                unexplained as f64 / WHOLE_UNIT as f64
            ),
        });
    }

    anomalies
}

/// Risk level as reflection sees it: CRITICAL on a critical anomaly, WARNING
/// on an execution failure, otherwise SAFE.
fn upgrade_level(assessment: &QualityAssessment, anomalies: &[Anomaly]) -> RiskLevel {
    if anomalies.iter().any(|a| a.severity == Severity::Critical) {
        RiskLevel::Critical
    } else if !assessment.overall_success {
        RiskLevel::Warning
    } else {
        RiskLevel::Safe
    }
}

/// Retry only on timeout or execution_error failures, and only while the
/// retry budget lasts.
fn retry_decision(
    ctx: &AuditContext,
    assessment: &QualityAssessment,
    failures: &[FailureKind],
) -> (bool, Option<RetryStrategy>) {
    if assessment.overall_success && assessment.confidence > 0.7 {
        return (false, None);
    }
    if ctx.retry_count >= ctx.config.pipeline.max_retries {
        return (false, None);
    }

    let retryable = failures
        .iter()
        .any(|f| matches!(f, FailureKind::Timeout | FailureKind::ExecutionError));
    if !retryable {
        return (false, None);
    }

    let strategy = if failures.contains(&FailureKind::Timeout) {
        RetryStrategy::IncreaseTimeout { multiplier: 2 }
    } else if failures.contains(&FailureKind::ExecutionError) {
        RetryStrategy::StateOverride {
            strategies: vec![
                "increase_balance".into(),
                "modify_timestamp".into(),
                "adjust_gas_limit".into(),
            ],
        }
    } else {
        RetryStrategy::SimpleRetry
    };
    (true, Some(strategy))
}

/// Intent-keyed improvement notes plus remediation steps for failures.
fn improvements(ctx: &AuditContext, failures: &[FailureKind]) -> Vec<String> {
    let mut notes = Vec::new();

    for failure in failures {
        match failure {
            FailureKind::Timeout => {
                notes.push("increase the simulation timeout or pin a closer fork block".into());
            }
            FailureKind::ExecutionError => {
                notes.push("verify the transaction parameters and target contract state".into());
            }
            FailureKind::Other => {}
        }
    }

    let category = ctx
        .perception
        .as_ref()
        .map(|p| p.intent.category)
        .unwrap_or(IntentCategory::Unknown);
    match category {
        IntentCategory::Swap => {
            notes.push("confirm the router is an official DEX contract".into());
            notes.push("check that the slippage setting is reasonable".into());
        }
        IntentCategory::Approve => {
            notes.push("verify the allowance amount is bounded".into());
            notes.push("confirm the spender contract is trusted".into());
        }
        _ => {}
    }

    notes.dedup();
    notes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditConfig;
    use crate::context::{ExecutionOutput, RawTransaction};
    use crate::forensics::AttackReport;
    use crate::simulator::models::{AssetChange, SimulationResult, NATIVE_ASSET};
    use std::sync::Arc;

    fn base_context() -> AuditContext {
        AuditContext::new(
            "Swap 1 ETH to USDC",
            RawTransaction::default(),
            Arc::new(AuditConfig::default()),
        )
    }

    fn simulation(success: bool, sender_delta: i128, declared: i128) -> SimulationResult {
        SimulationResult {
            chain_id: 1,
            block_number: 1,
            tx_from: "0x1111111111111111111111111111111111111111".into(),
            tx_to: "0x2222222222222222222222222222222222222222".into(),
            tx_value: declared.to_string(),
            tx_data: "0x".into(),
            success,
            gas_used: 21_000,
            gas_limit: 30_000_000,
            error_message: (!success).then(|| "insufficient liquidity".into()),
            asset_changes: vec![AssetChange {
                holder: "0x1111111111111111111111111111111111111111".into(),
                token_address: NATIVE_ASSET.into(),
                token_symbol: "ETH".into(),
                token_decimals: 18,
                balance_before: "0".into(),
                balance_after: "0".into(),
                change_amount: sender_delta.to_string(),
            }],
            call_traces: vec![],
            events: vec![],
            anomalies: vec![],
            risk_level: RiskLevel::Safe,
        }
    }

    #[test]
    fn clean_run_scores_point_seven() {
        let mut ctx = base_context();
        ctx.simulation = Some(simulation(true, -WHOLE_UNIT, WHOLE_UNIT));
        let quality = assess_quality(&ctx);
        assert!(quality.overall_success);
        assert_eq!(quality.confidence, 0.7);
    }

    #[test]
    fn failed_simulation_drops_confidence() {
        let mut ctx = base_context();
        ctx.simulation = Some(simulation(false, 0, 0));
        let quality = assess_quality(&ctx);
        assert!(!quality.overall_success);
        assert_eq!(quality.confidence, 0.3);
    }

    #[test]
    fn high_attack_score_raises_confidence() {
        let mut ctx = base_context();
        ctx.simulation = Some(simulation(true, 0, 0));
        ctx.execution = Some(ExecutionOutput {
            attack_report: Some(AttackReport {
                findings: vec![],
                risk_score: 0.8,
                risk_level: RiskLevel::Critical,
                summary: String::new(),
            }),
            ..ExecutionOutput::default()
        });
        assert_eq!(assess_quality(&ctx).confidence, 0.9);
    }

    #[test]
    fn intended_value_is_not_an_anomaly() {
        let mut ctx = base_context();
        ctx.simulation = Some(simulation(true, -WHOLE_UNIT, WHOLE_UNIT));
        assert!(detect_anomalies(&ctx).is_empty());
    }

    #[test]
    fn unexpected_outflow_is_critical() {
        let mut ctx = base_context();
        ctx.simulation = Some(simulation(true, -2 * WHOLE_UNIT, 0));
        let anomalies = detect_anomalies(&ctx);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].kind, "unexpected_outflow");
        assert_eq!(anomalies[0].severity, Severity::Critical);
        let quality = assess_quality(&ctx);
        assert_eq!(upgrade_level(&quality, &anomalies), RiskLevel::Critical);
    }

    #[test]
    fn failed_execution_upgrades_to_warning() {
        let mut ctx = base_context();
        ctx.simulation = Some(simulation(false, 0, 0));
        let quality = assess_quality(&ctx);
        let anomalies = detect_anomalies(&ctx);
        assert_eq!(upgrade_level(&quality, &anomalies), RiskLevel::Warning);
    }

    #[test]
    fn retry_respects_budget_and_failure_class() {
        let mut ctx = base_context();
        ctx.simulation = None;
        let quality = assess_quality(&ctx);

        // Timeout failures retry with a longer deadline.
        let (retry, strategy) = retry_decision(&ctx, &quality, &[FailureKind::Timeout]);
        assert!(retry);
        assert_eq!(
            strategy,
            Some(RetryStrategy::IncreaseTimeout { multiplier: 2 })
        );

        // Reverts are not retryable failures.
        let (retry, _) = retry_decision(&ctx, &quality, &[]);
        assert!(!retry);

        // Budget exhausted.
        ctx.retry_count = ctx.config.pipeline.max_retries;
        let (retry, _) = retry_decision(&ctx, &quality, &[FailureKind::Timeout]);
        assert!(!retry);
    }

    #[test]
    fn execution_error_selects_state_override() {
        let ctx = base_context();
        let quality = QualityAssessment {
            overall_success: false,
            confidence: 0.3,
            issues: vec![],
        };
        let (retry, strategy) =
            retry_decision(&ctx, &quality, &[FailureKind::ExecutionError]);
        assert!(retry);
        assert!(matches!(strategy, Some(RetryStrategy::StateOverride { .. })));
    }

    #[test]
    fn swap_intent_gets_router_notes() {
        let mut ctx = base_context();
        let result = simulation(true, 0, 0);
        ctx.perception = Some(crate::context::PerceptionOutput {
            intent: crate::stages::perception::parse_intent("Swap 1 ETH"),
            request: crate::simulator::models::SimulationRequest {
                chain_id: result.chain_id,
                tx_from: result.tx_from.clone(),
                tx_to: result.tx_to.clone(),
                tx_value: result.tx_value.clone(),
                tx_data: result.tx_data.clone(),
                fork_block: None,
                gas_limit: result.gas_limit,
            },
            complexity: crate::types::Complexity::Medium,
            warnings: vec![],
        });
        let notes = improvements(&ctx, &[]);
        assert!(notes.iter().any(|n| n.contains("DEX")));
    }
}
