//! Core domain types shared across the txsentry audit pipeline.
//!
//! This module defines the small closed vocabularies every other module speaks:
//! risk levels, finding severities, plan task priorities, and the stage
//! identifiers that drive pipeline routing.
//!
//! # Key Types
//!
//! - [`RiskLevel`]: the three-valued verdict classification
//! - [`Severity`]: per-finding severity with its score weight
//! - [`TaskPriority`]: plan task priority used for ordering and abort rules
//! - [`StageName`]: identifies pipeline stages in history and routing
//!
//! # Examples
//!
//! ```rust
//! use txsentry::types::{RiskLevel, Severity};
//!
//! // Levels are totally ordered: SAFE < WARNING < CRITICAL.
//! assert!(RiskLevel::Critical > RiskLevel::Warning);
//! assert_eq!(RiskLevel::from_score(0.72), RiskLevel::Critical);
//!
//! // Severities carry the weight used by the risk score.
//! assert_eq!(Severity::Critical.weight(), 0.4);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final risk classification for an audited transaction.
///
/// Levels are totally ordered so verdict fusion can take the maximum across
/// contributors (`SAFE < WARNING < CRITICAL`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    /// No attack pattern detected and the simulation matched the intent.
    Safe,
    /// Suspicious signals or an execution failure worth a human look.
    Warning,
    /// Strong evidence of an attack pattern or unexpected asset loss.
    Critical,
}

impl RiskLevel {
    /// Map a risk score in `[0, 1]` to a level using the fixed thresholds:
    /// `>= 0.7` is CRITICAL, `>= 0.4` is WARNING, anything below is SAFE.
    #[must_use]
    pub fn from_score(score: f64) -> Self {
        if score >= 0.7 {
            RiskLevel::Critical
        } else if score >= 0.4 {
            RiskLevel::Warning
        } else {
            RiskLevel::Safe
        }
    }

    /// Canonical uppercase rendering (`"SAFE"`, `"WARNING"`, `"CRITICAL"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Warning => "WARNING",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Safe
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to a single finding.
///
/// The variant order doubles as the ordering used when ranking findings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Warning,
    High,
    Critical,
}

impl Severity {
    /// Contribution weight of one finding at this severity. The overall risk
    /// score is `sum(weight * confidence)` capped at 1.0.
    #[must_use]
    pub fn weight(&self) -> f64 {
        match self {
            Severity::Low => 0.1,
            Severity::Warning => 0.15,
            Severity::High => 0.3,
            Severity::Critical => 0.4,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Warning => "warning",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Priority assigned to a plan task.
///
/// Ordering is numeric (`critical=3 > high=2 > medium=1 > low=0`) and is used
/// both for topological tie-breaking and for the abort-on-critical-failure
/// rule in the executor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    /// Numeric priority value used for tie-breaking in plan ordering.
    #[must_use]
    pub fn value(&self) -> u8 {
        match self {
            TaskPriority::Low => 0,
            TaskPriority::Medium => 1,
            TaskPriority::High => 2,
            TaskPriority::Critical => 3,
        }
    }
}

/// Identifies a pipeline stage in routing decisions and execution history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Perception,
    Planner,
    Executor,
    Reflection,
    Aggregator,
}

impl StageName {
    /// Stable lowercase identifier, used in history, events, and config.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Perception => "perception",
            StageName::Planner => "planner",
            StageName::Executor => "executor",
            StageName::Reflection => "reflection",
            StageName::Aggregator => "aggregator",
        }
    }

    /// Parse a stage identifier, for config `enabled_agents` entries.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "perception" => Some(StageName::Perception),
            "planner" => Some(StageName::Planner),
            "executor" => Some(StageName::Executor),
            "reflection" => Some(StageName::Reflection),
            "aggregator" => Some(StageName::Aggregator),
            _ => None,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing decision returned by a stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NextStep {
    Planner,
    Executor,
    Reflection,
    Aggregator,
    /// Terminal: the verdict is final.
    Done,
}

/// Intent category recognized by perception.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Swap,
    Approve,
    Transfer,
    Mint,
    Stake,
    Claim,
    #[default]
    Unknown,
}

impl IntentCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentCategory::Swap => "swap",
            IntentCategory::Approve => "approve",
            IntentCategory::Transfer => "transfer",
            IntentCategory::Mint => "mint",
            IntentCategory::Stake => "stake",
            IntentCategory::Claim => "claim",
            IntentCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task complexity decided by perception; complex tasks get a plan.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Medium,
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Complexity::Simple => "simple",
            Complexity::Medium => "medium",
            Complexity::Complex => "complex",
        };
        f.write_str(s)
    }
}
