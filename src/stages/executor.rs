//! Executor: drive the capability providers and collect their results.
//!
//! Two modes. The fast path runs a fixed sequence (static risk check, sandbox
//! start, simulate, then trace analysis and attack detection when execution
//! succeeded). The plan path walks the planner's parallel groups, running
//! each group's tasks concurrently under a shared deadline with per-task
//! failure containment; only a failed `critical` task aborts the walk.

use async_trait::async_trait;
use futures_util::future::join_all;
use std::time::Duration;
use tracing::instrument;

use crate::context::{
    AuditContext, CapabilityAction, ExecutionOutput, FailureKind, PerceptionOutput, PlanOutput,
    RetryStrategy, TaskId, TaskOutcome,
};
use crate::forensics::{AttackContext, AttackReport, TraceAnalysis};
use crate::simulator::models::{SimulationRequest, SimulationResult};
use crate::simulator::pool::PooledSimulator;
use crate::simulator::SimulatorError;
use crate::stage::{Stage, StageEnv, StageError, StageReport};
use crate::types::{NextStep, StageName, TaskPriority};

pub struct ExecutorStage;

/// What a finished task hands back for context updates.
enum TaskPayload {
    Static(AttackReport),
    Setup { fork_block: u64 },
    Simulation(Box<SimulationResult>),
    Trace(TraceAnalysis),
    Attack(AttackReport),
}

struct TaskRun {
    task_id: TaskId,
    result: Result<TaskPayload, (String, FailureKind)>,
}

/// Mutable scratch state threaded through one executor pass.
#[derive(Default)]
struct PassState {
    static_report: Option<AttackReport>,
    dynamic_report: Option<AttackReport>,
    trace_analysis: Option<TraceAnalysis>,
    simulation: Option<SimulationResult>,
    outcomes: Vec<TaskOutcome>,
    failures: Vec<FailureKind>,
}

impl PassState {
    fn record(&mut self, run: TaskRun) -> bool {
        match run.result {
            Ok(payload) => {
                self.outcomes.push(TaskOutcome {
                    task_id: run.task_id,
                    success: true,
                    error: None,
                });
                match payload {
                    TaskPayload::Static(report) => self.static_report = Some(report),
                    TaskPayload::Setup { .. } => {}
                    TaskPayload::Simulation(result) => self.simulation = Some(*result),
                    TaskPayload::Trace(analysis) => self.trace_analysis = Some(analysis),
                    TaskPayload::Attack(report) => self.dynamic_report = Some(report),
                }
                true
            }
            Err((message, kind)) => {
                self.outcomes.push(TaskOutcome {
                    task_id: run.task_id,
                    success: false,
                    error: Some(message),
                });
                self.failures.push(kind);
                false
            }
        }
    }
}

#[async_trait]
impl Stage for ExecutorStage {
    fn name(&self) -> StageName {
        StageName::Executor
    }

    #[instrument(skip_all, fields(retry = ctx.retry_count))]
    async fn run(
        &self,
        ctx: &mut AuditContext,
        env: &StageEnv,
    ) -> Result<StageReport, StageError> {
        let perception = ctx.perception.clone().ok_or(StageError::MissingInput {
            what: "perception output",
        })?;
        let request = adjusted_request(&perception, ctx.reflection.as_ref().map(|r| &r.strategy));
        let deadline = effective_deadline(ctx);

        let mut pass = PassState::default();
        match ctx.plan.clone() {
            Some(plan) => {
                self.run_plan(env, &perception, &request, &plan, deadline, &mut pass)
                    .await?;
            }
            None => {
                self.run_fast_path(env, &perception, &request, deadline, &mut pass)
                    .await?;
            }
        }

        let fused = fuse_reports(&pass);
        let invoked = pass.outcomes.len();
        let successes = pass.outcomes.iter().filter(|o| o.success).count();
        let overall_success = invoked > 0 && successes * 2 > invoked;
        let confidence = if invoked == 0 {
            0.0
        } else {
            successes as f64 / invoked as f64
        };

        env.emit(
            StageName::Executor,
            "summary",
            format!("{successes}/{invoked} task(s) succeeded"),
        );

        // Copy the simulation result into its dedicated slot so downstream
        // stages never walk the task outcomes.
        ctx.simulation = pass.simulation.take();
        ctx.execution = Some(ExecutionOutput {
            outcomes: pass.outcomes,
            overall_success,
            trace_analysis: pass.trace_analysis,
            attack_report: fused,
            failures: pass.failures,
        });

        let report = if overall_success {
            StageReport::ok(confidence, NextStep::Reflection)
        } else {
            StageReport::degraded(confidence, NextStep::Reflection)
        };
        Ok(report)
    }
}

impl ExecutorStage {
    /// Fixed sequence for simple tasks.
    async fn run_fast_path(
        &self,
        env: &StageEnv,
        perception: &PerceptionOutput,
        request: &SimulationRequest,
        deadline: Duration,
        pass: &mut PassState,
    ) -> Result<(), StageError> {
        env.emit(StageName::Executor, "mode", "fast path");

        let static_run = run_static(env, request);
        pass.record(static_run);

        let handle = acquire_simulator(env).await?;

        let setup =
            run_with_deadline(deadline, TaskId::SetupEnvironment, run_setup(&handle)).await;
        if !pass.record(setup) {
            // Without a sandbox the critical simulation cannot run.
            pass.record(TaskRun {
                task_id: TaskId::SimulateTx,
                result: Err((
                    "sandbox unavailable".into(),
                    FailureKind::ExecutionError,
                )),
            });
            return Ok(());
        }

        let simulate =
            run_with_deadline(deadline, TaskId::SimulateTx, run_simulate(&handle, request)).await;
        pass.record(simulate);

        let executed_ok = pass
            .simulation
            .as_ref()
            .is_some_and(|result| result.success);
        if executed_ok {
            let trace = run_trace_analysis(env, perception, pass.simulation.as_ref());
            pass.record(trace);
            let attack = run_attack_detection(env, perception, pass.simulation.as_ref());
            pass.record(attack);
        }
        Ok(())
    }

    /// Walk the plan's parallel groups in order.
    async fn run_plan(
        &self,
        env: &StageEnv,
        perception: &PerceptionOutput,
        request: &SimulationRequest,
        plan: &PlanOutput,
        deadline: Duration,
        pass: &mut PassState,
    ) -> Result<(), StageError> {
        env.emit(
            StageName::Executor,
            "mode",
            format!("plan path ({} group(s))", plan.parallel_groups.len()),
        );
        let handle = acquire_simulator(env).await?;

        'groups: for group in &plan.parallel_groups {
            // Every task in the level starts before any task of the next
            // level; one task's failure never cancels its siblings.
            let futures = group.iter().map(|task_id| {
                let task = plan
                    .tasks
                    .iter()
                    .find(|t| t.id == *task_id)
                    .expect("plan groups reference planned tasks");
                run_planned_task(
                    task.id,
                    task.action,
                    env,
                    perception,
                    request,
                    &handle,
                    pass.simulation.as_ref(),
                    deadline,
                )
            });
            let runs = join_all(futures).await;

            let mut abort = false;
            for run in runs {
                let task_id = run.task_id;
                let succeeded = pass.record(run);
                if !succeeded && priority_of(plan, task_id) == TaskPriority::Critical {
                    env.emit(
                        StageName::Executor,
                        "abort",
                        format!("critical task {} failed", task_id.as_str()),
                    );
                    abort = true;
                }
            }
            if abort {
                break 'groups;
            }
        }
        Ok(())
    }
}

fn priority_of(plan: &PlanOutput, task_id: TaskId) -> TaskPriority {
    plan.tasks
        .iter()
        .find(|t| t.id == task_id)
        .map(|t| t.priority)
        .unwrap_or(TaskPriority::Low)
}

async fn acquire_simulator(env: &StageEnv) -> Result<PooledSimulator, StageError> {
    std::sync::Arc::clone(&env.capabilities.simulators)
        .acquire()
        .await
        .map_err(|e| StageError::Provider {
            provider: "simulator",
            message: e.to_string(),
        })
}

/// Per-pass request adjustments driven by the retry strategy.
fn adjusted_request(
    perception: &PerceptionOutput,
    strategy: Option<&Option<RetryStrategy>>,
) -> SimulationRequest {
    let mut request = perception.request.clone();
    if let Some(Some(RetryStrategy::StateOverride { .. })) = strategy {
        // Of the override strategies only the gas-limit raise is expressible
        // through the provider seam; the rest stay advisory.
        request.gas_limit = request.gas_limit.saturating_mul(2);
    }
    request
}

/// Group deadline, relaxed by the increase-timeout retry strategy.
fn effective_deadline(ctx: &AuditContext) -> Duration {
    let base = ctx.config.simulator.deadline();
    match ctx
        .reflection
        .as_ref()
        .and_then(|r| r.strategy.as_ref())
    {
        Some(RetryStrategy::IncreaseTimeout { multiplier }) => base * (*multiplier).max(1),
        _ => base,
    }
}

async fn run_with_deadline(
    deadline: Duration,
    task_id: TaskId,
    task: impl std::future::Future<Output = TaskRun>,
) -> TaskRun {
    match tokio::time::timeout(deadline, task).await {
        Ok(run) => run,
        Err(_) => TaskRun {
            task_id,
            result: Err((
                format!("task deadline of {:.1}s exceeded", deadline.as_secs_f64()),
                FailureKind::Timeout,
            )),
        },
    }
}

fn run_static(env: &StageEnv, request: &SimulationRequest) -> TaskRun {
    let report = env.capabilities.forensics.check_risk_patterns(
        &request.tx_to,
        &request.tx_data,
        None,
    );
    TaskRun {
        task_id: TaskId::StaticAnalysis,
        result: Ok(TaskPayload::Static(report)),
    }
}

async fn run_setup(handle: &PooledSimulator) -> TaskRun {
    let result = handle
        .ensure_started()
        .await
        .map(|fork_block| TaskPayload::Setup { fork_block })
        .map_err(|e| (e.to_string(), classify_failure(&e)));
    TaskRun {
        task_id: TaskId::SetupEnvironment,
        result,
    }
}

async fn run_simulate(handle: &PooledSimulator, request: &SimulationRequest) -> TaskRun {
    let result = handle
        .simulate(request)
        .await
        .map(|r| TaskPayload::Simulation(Box::new(r)))
        .map_err(|e| (e.to_string(), classify_failure(&e)));
    TaskRun {
        task_id: TaskId::SimulateTx,
        result,
    }
}

fn run_trace_analysis(
    env: &StageEnv,
    _perception: &PerceptionOutput,
    simulation: Option<&SimulationResult>,
) -> TaskRun {
    let result = match simulation {
        Some(result) => {
            let analysis = env.capabilities.forensics.analyze_trace(
                &result.call_traces,
                &result.tx_from,
                &result.tx_to,
                &result.tx_value,
            );
            Ok(TaskPayload::Trace(analysis))
        }
        None => Err((
            "simulation result unavailable".to_string(),
            FailureKind::Other,
        )),
    };
    TaskRun {
        task_id: TaskId::TraceAnalysis,
        result,
    }
}

fn run_attack_detection(
    env: &StageEnv,
    perception: &PerceptionOutput,
    simulation: Option<&SimulationResult>,
) -> TaskRun {
    let result = match simulation {
        Some(result) => {
            let attack_ctx = AttackContext {
                sender: &result.tx_from,
                declared_value: result.declared_value(),
                intent: perception.intent.category,
            };
            let report = env.capabilities.forensics.detect_attack(
                &result.call_traces,
                &result.asset_changes,
                &attack_ctx,
            );
            Ok(TaskPayload::Attack(report))
        }
        None => Err((
            "simulation result unavailable".to_string(),
            FailureKind::Other,
        )),
    };
    TaskRun {
        task_id: TaskId::AttackDetection,
        result,
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_planned_task(
    task_id: TaskId,
    action: CapabilityAction,
    env: &StageEnv,
    perception: &PerceptionOutput,
    request: &SimulationRequest,
    handle: &PooledSimulator,
    simulation: Option<&SimulationResult>,
    deadline: Duration,
) -> TaskRun {
    let run = async {
        match action {
            CapabilityAction::ForensicsCheckRiskPatterns => run_static(env, request),
            CapabilityAction::SimulatorStart => run_setup(handle).await,
            CapabilityAction::SimulatorSimulate => run_simulate(handle, request).await,
            CapabilityAction::ForensicsAnalyzeTrace => {
                run_trace_analysis(env, perception, simulation)
            }
            CapabilityAction::ForensicsDetectAttack => {
                run_attack_detection(env, perception, simulation)
            }
        }
    };
    match tokio::time::timeout(deadline, run).await {
        Ok(mut run) => {
            run.task_id = task_id;
            run
        }
        Err(_) => TaskRun {
            task_id,
            result: Err((
                format!("task deadline of {:.1}s exceeded", deadline.as_secs_f64()),
                FailureKind::Timeout,
            )),
        },
    }
}

fn classify_failure(error: &SimulatorError) -> FailureKind {
    if error.is_timeout() {
        FailureKind::Timeout
    } else if matches!(error, SimulatorError::Unsupported { .. }) {
        FailureKind::Other
    } else {
        FailureKind::ExecutionError
    }
}

/// Fuse the static and dynamic attack reports; either may be missing.
fn fuse_reports(pass: &PassState) -> Option<AttackReport> {
    match (&pass.static_report, &pass.dynamic_report) {
        (Some(s), Some(d)) => Some(AttackReport::fuse(&[s, d])),
        (Some(s), None) => Some(s.clone()),
        (None, Some(d)) => Some(d.clone()),
        (None, None) => None,
    }
}
