//! The staged audit pipeline.
//!
//! One [`AuditPipeline`] serves one audit: it owns its simulator pool and
//! isolation manager, drives the stages in declared order (perception →
//! planner? → executor → reflection → executor-on-retry? → aggregator), and
//! guarantees cleanup — sandbox children stopped, isolation environment
//! destroyed, ephemeral keys erased — on every exit path, including the
//! whole-audit deadline, stage errors, and cancellation.

use miette::Diagnostic;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::config::AuditConfig;
use crate::context::{AuditContext, RawTransaction};
use crate::events::{AuditEvent, EventEmitter, SharedEmitter};
use crate::forensics::ForensicsAnalyzer;
use crate::isolation::{EnvironmentSpec, IsolationError, IsolationManager};
use crate::reasoning;
use crate::simulator::SimulatorPool;
use crate::stage::{Capabilities, Stage, StageEnv, StageError};
use crate::stages::{
    AggregatorStage, ExecutorStage, PerceptionStage, PlannerStage, ReflectionStage,
};
use crate::types::{NextStep, StageName};
use crate::verdict::Verdict;

/// Cooperative cancellation flag checked before each execution pass.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Classification of an audit failure, for transport status mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Malformed input; HTTP 400.
    Validation,
    /// The whole-audit deadline elapsed; fatal.
    Timeout,
    /// The transport cancelled the audit.
    Cancelled,
    /// The selected backend is not implemented; HTTP 501.
    Unimplemented,
    /// Internal invariant violation or unrecoverable provider failure.
    Internal,
}

/// A failed audit: the stage-error report the transport returns when no
/// usable verdict exists.
#[derive(Debug, Error, Diagnostic)]
#[error("audit failed in {error_stage}: {error_message}")]
#[diagnostic(code(txsentry::pipeline::failed))]
pub struct AuditFailure {
    pub class: FailureClass,
    pub error_stage: String,
    pub error_message: String,
    pub user_intent: String,
    pub execution_history: Vec<String>,
}

impl AuditFailure {
    /// The `{success: false, ...}` report body.
    #[must_use]
    pub fn to_report(&self) -> serde_json::Value {
        json!({
            "success": false,
            "error_stage": self.error_stage,
            "error_message": self.error_message,
            "user_intent": self.user_intent,
            "execution_history": self.execution_history,
        })
    }
}

/// One audit's pipeline instance.
pub struct AuditPipeline {
    config: Arc<AuditConfig>,
    capabilities: Capabilities,
    isolation: Arc<IsolationManager>,
    emitter: SharedEmitter,
}

impl AuditPipeline {
    /// Build a pipeline with production providers from configuration.
    #[must_use]
    pub fn new(config: Arc<AuditConfig>) -> Self {
        let capabilities = Capabilities {
            simulators: SimulatorPool::anvil(&config.simulator),
            forensics: Arc::new(ForensicsAnalyzer::new()),
            oracle: reasoning::oracle_for(config.reasoning.engine),
        };
        let isolation = Arc::new(IsolationManager::from_config(&config.isolation));
        Self::with_parts(
            config,
            capabilities,
            isolation,
            Arc::new(EventEmitter::tracing_only()),
        )
    }

    /// Build a pipeline from explicit parts (tests inject scripted providers
    /// through here).
    #[must_use]
    pub fn with_parts(
        config: Arc<AuditConfig>,
        capabilities: Capabilities,
        isolation: Arc<IsolationManager>,
        emitter: SharedEmitter,
    ) -> Self {
        Self {
            config,
            capabilities,
            isolation,
            emitter,
        }
    }

    /// The isolation manager, for status probes.
    #[must_use]
    pub fn isolation(&self) -> Arc<IsolationManager> {
        Arc::clone(&self.isolation)
    }

    /// Run one audit end to end. The per-audit deadline bounds the staged
    /// run; cleanup happens before this returns, on every path.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        user_intent: impl Into<String>,
        raw_tx: RawTransaction,
        cancel: CancelToken,
    ) -> Result<Verdict, AuditFailure> {
        let user_intent = user_intent.into();
        let mut ctx = AuditContext::new(&user_intent, raw_tx, Arc::clone(&self.config));

        let guard = CleanupGuard::new(
            Arc::clone(&self.capabilities.simulators),
            Arc::clone(&self.isolation),
        );

        let deadline = self.config.pipeline.deadline();
        let driven = tokio::time::timeout(deadline, self.drive(&mut ctx, &cancel)).await;

        guard.disarm();
        self.cleanup().await;

        match driven {
            Err(_) => Err(self.failure(
                &ctx,
                FailureClass::Timeout,
                "pipeline",
                format!("audit deadline of {:.3}s exceeded", deadline.as_secs_f64()),
            )),
            Ok(Err(failure)) => Err(failure),
            Ok(Ok(())) => ctx.verdict.take().ok_or_else(|| {
                self.failure(
                    &ctx,
                    FailureClass::Internal,
                    "aggregator",
                    "aggregator produced no verdict".to_string(),
                )
            }),
        }
    }

    /// Release every resource this audit may have opened.
    pub async fn cleanup(&self) {
        self.capabilities.simulators.shutdown().await;
        if let Err(e) = self.isolation.destroy().await {
            warn!(error = %e, "isolation teardown failed");
        }
    }

    async fn drive(
        &self,
        ctx: &mut AuditContext,
        cancel: &CancelToken,
    ) -> Result<(), AuditFailure> {
        self.prepare_isolation(ctx).await?;

        let env = StageEnv {
            emitter: Arc::clone(&self.emitter),
            capabilities: self.capabilities.clone(),
        };

        let report = self.run_stage(&PerceptionStage, ctx, &env).await?;

        let planner_wanted = report.next == NextStep::Planner
            && !self.config.pipeline.skip_planner
            && self.config.pipeline.agent_enabled(StageName::Planner);
        if planner_wanted {
            self.run_stage(&PlannerStage, ctx, &env).await?;
        }

        let reflection_enabled = self.config.pipeline.agent_enabled(StageName::Reflection);
        loop {
            if cancel.is_cancelled() {
                return Err(self.failure(
                    ctx,
                    FailureClass::Cancelled,
                    "pipeline",
                    "audit cancelled by the transport".to_string(),
                ));
            }

            self.run_stage(&ExecutorStage, ctx, &env).await?;

            if !reflection_enabled {
                break;
            }
            let report = self.run_stage(&ReflectionStage, ctx, &env).await?;
            if report.next != NextStep::Executor {
                break;
            }
            self.emitter.emit(AuditEvent::diagnostic(
                "pipeline.retry",
                format!("re-running executor (retry {})", ctx.retry_count),
            ));
        }

        self.run_stage(&AggregatorStage, ctx, &env).await?;
        Ok(())
    }

    /// Bring up the isolation environment and the audit-scoped key. Failures
    /// degrade to a warning, except an unimplemented backend, which is a
    /// hard error the transport maps to 501.
    async fn prepare_isolation(&self, ctx: &mut AuditContext) -> Result<(), AuditFailure> {
        match self.isolation.create(EnvironmentSpec::default()).await {
            Ok((env_id, _)) => {
                if let Err(e) = self.isolation.generate_key("ephemeral", "transaction") {
                    warn!(error = %e, "ephemeral key generation failed");
                }
                self.emitter.emit(AuditEvent::diagnostic(
                    "isolation.create",
                    format!("environment {env_id} ready"),
                ));
                Ok(())
            }
            Err(e @ IsolationError::Unimplemented { .. }) => Err(self.failure(
                ctx,
                FailureClass::Unimplemented,
                "isolation",
                e.to_string(),
            )),
            Err(e) => {
                warn!(error = %e, "isolation environment unavailable; continuing without");
                Ok(())
            }
        }
    }

    async fn run_stage(
        &self,
        stage: &dyn Stage,
        ctx: &mut AuditContext,
        env: &StageEnv,
    ) -> Result<crate::stage::StageReport, AuditFailure> {
        let name = stage.name();
        let report = stage
            .run(ctx, env)
            .await
            .map_err(|e| self.stage_failure(ctx, name, e))?;
        ctx.record_stage(name);
        Ok(report)
    }

    fn stage_failure(
        &self,
        ctx: &AuditContext,
        stage: StageName,
        error: StageError,
    ) -> AuditFailure {
        let class = match &error {
            StageError::Validation { .. } => FailureClass::Validation,
            StageError::DeadlineExceeded { .. } => FailureClass::Timeout,
            StageError::Cancelled => FailureClass::Cancelled,
            _ => FailureClass::Internal,
        };
        self.failure(ctx, class, stage.as_str(), error.to_string())
    }

    fn failure(
        &self,
        ctx: &AuditContext,
        class: FailureClass,
        stage: &str,
        message: String,
    ) -> AuditFailure {
        AuditFailure {
            class,
            error_stage: stage.to_string(),
            error_message: message,
            user_intent: ctx.user_intent.clone(),
            execution_history: ctx.history_strings(),
        }
    }
}

/// Spawns cleanup if the audit future is dropped before finishing (transport
/// disconnect), so sandbox children and environments never outlive the audit.
struct CleanupGuard {
    pool: Option<Arc<SimulatorPool>>,
    isolation: Option<Arc<IsolationManager>>,
}

impl CleanupGuard {
    fn new(pool: Arc<SimulatorPool>, isolation: Arc<IsolationManager>) -> Self {
        Self {
            pool: Some(pool),
            isolation: Some(isolation),
        }
    }

    fn disarm(mut self) {
        self.pool = None;
        self.isolation = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        let (Some(pool), Some(isolation)) = (self.pool.take(), self.isolation.take()) else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                pool.shutdown().await;
                let _ = isolation.destroy().await;
            });
        }
    }
}
