//! Model-opinion seam for verdict fusion.
//!
//! The language model is an external collaborator: this module defines only
//! the structured request/response contract and a deterministic mock. The
//! oracle is advisory — it may nudge confidence and attach a note, but it can
//! never lower the rule-derived risk level.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::ReasoningEngine;
use crate::types::{IntentCategory, RiskLevel};

/// Draft verdict summary handed to the oracle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OracleInput {
    pub intent: String,
    pub category: IntentCategory,
    pub risk_level: RiskLevel,
    pub risk_score: f64,
    pub finding_kinds: Vec<String>,
}

/// Structured oracle response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelOpinion {
    pub concurs: bool,
    /// Confidence adjustment; the aggregator clamps it to `[-0.1, 0.1]`.
    pub confidence_adjustment: f64,
    pub note: Option<String>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum OracleError {
    #[error("model oracle unavailable: {message}")]
    #[diagnostic(code(txsentry::reasoning::unavailable))]
    Unavailable { message: String },
}

/// Opaque structured-response oracle.
#[async_trait]
pub trait ModelOracle: Send + Sync {
    async fn assess(&self, input: &OracleInput) -> Result<ModelOpinion, OracleError>;
}

/// Never consulted; stands in when the engine is `rules_only`.
pub struct NullOracle;

#[async_trait]
impl ModelOracle for NullOracle {
    async fn assess(&self, _input: &OracleInput) -> Result<ModelOpinion, OracleError> {
        Err(OracleError::Unavailable {
            message: "reasoning engine is rules_only".into(),
        })
    }
}

/// Deterministic mock: concurs with the rules, slightly reinforcing elevated
/// verdicts.
pub struct MockOracle;

#[async_trait]
impl ModelOracle for MockOracle {
    async fn assess(&self, input: &OracleInput) -> Result<ModelOpinion, OracleError> {
        let elevated = input.risk_score >= 0.4;
        Ok(ModelOpinion {
            concurs: true,
            confidence_adjustment: if elevated { 0.05 } else { 0.0 },
            note: elevated.then(|| {
                format!(
                    "model opinion concurs with the {} classification",
                    input.risk_level
                )
            }),
        })
    }
}

/// Select the oracle for the configured engine. `rules_plus_model` deployments
/// plug a provider-backed implementation in place of the mock.
#[must_use]
pub fn oracle_for(engine: ReasoningEngine) -> Arc<dyn ModelOracle> {
    match engine {
        ReasoningEngine::RulesOnly => Arc::new(NullOracle),
        ReasoningEngine::RulesPlusModel | ReasoningEngine::Mock => Arc::new(MockOracle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(score: f64) -> OracleInput {
        OracleInput {
            intent: "swap 1 eth".into(),
            category: IntentCategory::Swap,
            risk_level: RiskLevel::from_score(score),
            risk_score: score,
            finding_kinds: vec![],
        }
    }

    #[tokio::test]
    async fn mock_is_neutral_on_safe() {
        let opinion = MockOracle.assess(&input(0.0)).await.unwrap();
        assert!(opinion.concurs);
        assert_eq!(opinion.confidence_adjustment, 0.0);
        assert!(opinion.note.is_none());
    }

    #[tokio::test]
    async fn mock_reinforces_elevated_risk() {
        let opinion = MockOracle.assess(&input(0.8)).await.unwrap();
        assert_eq!(opinion.confidence_adjustment, 0.05);
        assert!(opinion.note.unwrap().contains("CRITICAL"));
    }

    #[tokio::test]
    async fn null_oracle_reports_unavailable() {
        assert!(NullOracle.assess(&input(0.0)).await.is_err());
    }
}
