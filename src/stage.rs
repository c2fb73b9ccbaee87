//! Stage execution framework for the audit pipeline.
//!
//! A [`Stage`] is one unit of the staged analysis loop (perception, planner,
//! executor, reflection, aggregator). Stages receive exclusive access to the
//! [`AuditContext`](crate::context::AuditContext) and a [`StageEnv`] carrying
//! the capability providers and the event emitter, and return a
//! [`StageReport`] with a routing decision.
//!
//! # Error Handling
//!
//! Stages handle failure two ways, mirroring the distinction the rest of the
//! crate makes:
//!
//! 1. **Fatal errors**: return `Err(StageError)` — the pipeline stops and
//!    reports the failing stage.
//! 2. **Recoverable degradation**: record the problem in the stage's output
//!    slot and return `Ok` with `success: false`; the aggregator still runs
//!    over whatever usable data exists.

use async_trait::async_trait;
use miette::Diagnostic;
use std::sync::Arc;
use thiserror::Error;

use crate::context::AuditContext;
use crate::events::SharedEmitter;
use crate::forensics::ForensicsAnalyzer;
use crate::reasoning::ModelOracle;
use crate::simulator::SimulatorPool;
use crate::types::{NextStep, StageName};

/// Capability providers available to stages. Only the executor invokes them;
/// other stages are pure over the context.
#[derive(Clone)]
pub struct Capabilities {
    pub simulators: Arc<SimulatorPool>,
    pub forensics: Arc<ForensicsAnalyzer>,
    pub oracle: Arc<dyn ModelOracle>,
}

/// Execution environment handed to each stage invocation.
#[derive(Clone)]
pub struct StageEnv {
    pub emitter: SharedEmitter,
    pub capabilities: Capabilities,
}

impl StageEnv {
    /// Emit a stage-scoped progress event.
    pub fn emit(&self, stage: StageName, scope: &str, message: impl Into<String>) {
        self.emitter
            .emit(crate::events::AuditEvent::stage(stage, scope, message));
    }
}

/// Report returned by a completed stage.
#[derive(Clone, Debug)]
pub struct StageReport {
    pub success: bool,
    /// Stage confidence in its own output, in `[0, 1]`.
    pub confidence: f64,
    pub next: NextStep,
}

impl StageReport {
    #[must_use]
    pub fn ok(confidence: f64, next: NextStep) -> Self {
        Self {
            success: true,
            confidence,
            next,
        }
    }

    #[must_use]
    pub fn degraded(confidence: f64, next: NextStep) -> Self {
        Self {
            success: false,
            confidence,
            next,
        }
    }
}

/// Fatal errors halting the pipeline.
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    /// Input failed validation; surfaced as HTTP 400 and never retried.
    #[error("validation failed: {message}")]
    #[diagnostic(
        code(txsentry::stage::validation),
        help("Check the transaction fields and required parameters.")
    )]
    Validation { message: String },

    /// A prior stage did not leave the output this stage requires.
    #[error("missing expected stage output: {what}")]
    #[diagnostic(
        code(txsentry::stage::missing_input),
        help("The pipeline routed here without the prerequisite stage output: {what}.")
    )]
    MissingInput { what: &'static str },

    /// A capability provider failed without a recovery path.
    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(txsentry::stage::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    /// The whole-audit deadline elapsed.
    #[error("audit deadline exceeded after {seconds:.3}s")]
    #[diagnostic(code(txsentry::stage::timeout))]
    DeadlineExceeded { seconds: f64 },

    /// The transport cancelled the audit.
    #[error("audit cancelled")]
    #[diagnostic(code(txsentry::stage::cancelled))]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(code(txsentry::stage::serde_json))]
    Serde(#[from] serde_json::Error),
}

/// One unit of the staged audit loop.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable identifier used in history, events, and error reports.
    fn name(&self) -> StageName;

    /// Execute this stage against the audit context.
    async fn run(
        &self,
        ctx: &mut AuditContext,
        env: &StageEnv,
    ) -> Result<StageReport, StageError>;
}
