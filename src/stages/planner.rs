//! Planner: decompose a complex audit into a DAG of capability invocations.
//!
//! The canonical task set is fixed: static analysis and environment setup are
//! independent roots, simulation depends on the environment, trace analysis
//! depends on simulation, and attack detection depends on both simulation and
//! trace analysis.

use async_trait::async_trait;

use crate::context::{AuditContext, CapabilityAction, PlanOutput, PlanTask, TaskId};
use crate::stage::{Stage, StageEnv, StageError, StageReport};
use crate::types::{NextStep, StageName, TaskPriority};

pub struct PlannerStage;

#[async_trait]
impl Stage for PlannerStage {
    fn name(&self) -> StageName {
        StageName::Planner
    }

    async fn run(
        &self,
        ctx: &mut AuditContext,
        env: &StageEnv,
    ) -> Result<StageReport, StageError> {
        let perception = ctx.perception.as_ref().ok_or(StageError::MissingInput {
            what: "perception output",
        })?;

        let has_calldata = perception.request.tx_data.len() > 2;
        let subtasks = canonical_tasks(has_calldata);
        let (ordered, warnings) = order_tasks(subtasks);
        let parallel_groups = group_parallel(&ordered);

        env.emit(
            StageName::Planner,
            "plan",
            format!(
                "{} task(s) in {} parallel group(s)",
                ordered.len(),
                parallel_groups.len()
            ),
        );

        ctx.plan = Some(PlanOutput {
            tasks: ordered,
            parallel_groups,
            warnings,
        });
        Ok(StageReport::ok(0.9, NextStep::Executor))
    }
}

/// The canonical task set. Static analysis is only planned when there is
/// calldata to inspect.
#[must_use]
pub fn canonical_tasks(has_calldata: bool) -> Vec<PlanTask> {
    let mut tasks = Vec::new();
    if has_calldata {
        tasks.push(PlanTask {
            id: TaskId::StaticAnalysis,
            action: CapabilityAction::ForensicsCheckRiskPatterns,
            priority: TaskPriority::High,
            depends_on: vec![],
        });
    }
    tasks.push(PlanTask {
        id: TaskId::SetupEnvironment,
        action: CapabilityAction::SimulatorStart,
        priority: TaskPriority::High,
        depends_on: vec![],
    });
    tasks.push(PlanTask {
        id: TaskId::SimulateTx,
        action: CapabilityAction::SimulatorSimulate,
        priority: TaskPriority::Critical,
        depends_on: vec![TaskId::SetupEnvironment],
    });
    tasks.push(PlanTask {
        id: TaskId::TraceAnalysis,
        action: CapabilityAction::ForensicsAnalyzeTrace,
        priority: TaskPriority::Medium,
        depends_on: vec![TaskId::SimulateTx],
    });
    tasks.push(PlanTask {
        id: TaskId::AttackDetection,
        action: CapabilityAction::ForensicsDetectAttack,
        priority: TaskPriority::High,
        depends_on: vec![TaskId::SimulateTx, TaskId::TraceAnalysis],
    });
    tasks
}

/// Topologically order tasks: repeatedly take the ready task with the highest
/// priority; when nothing is ready (a dependency cycle or a reference to a
/// task that was not planned), fall back to the highest-priority remaining
/// task and record a warning.
#[must_use]
pub fn order_tasks(mut remaining: Vec<PlanTask>) -> (Vec<PlanTask>, Vec<String>) {
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut done: Vec<TaskId> = Vec::new();
    let mut warnings = Vec::new();

    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .enumerate()
            .filter(|(_, t)| t.depends_on.iter().all(|d| done.contains(d)))
            .max_by_key(|(_, t)| t.priority.value());

        let index = match ready {
            Some((index, _)) => index,
            None => {
                let (index, task) = remaining
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, t)| t.priority.value())
                    .expect("remaining is non-empty");
                warnings.push(format!(
                    "task {} has unsatisfiable dependencies; forcing by priority",
                    task.id.as_str()
                ));
                index
            }
        };

        let task = remaining.remove(index);
        done.push(task.id);
        ordered.push(task);
    }

    (ordered, warnings)
}

/// Group ordered tasks into parallel levels: a new level starts when the next
/// task depends on anything already placed in the current level.
#[must_use]
pub fn group_parallel(ordered: &[PlanTask]) -> Vec<Vec<TaskId>> {
    let mut groups: Vec<Vec<TaskId>> = Vec::new();
    let mut current: Vec<TaskId> = Vec::new();

    for task in ordered {
        if task.depends_on.iter().any(|d| current.contains(d)) {
            groups.push(std::mem::take(&mut current));
        }
        current.push(task.id);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_order_with_calldata() {
        let (ordered, warnings) = order_tasks(canonical_tasks(true));
        assert!(warnings.is_empty());
        let ids: Vec<TaskId> = ordered.iter().map(|t| t.id).collect();

        // simulate_tx must follow setup, attack detection must come last.
        let position = |id: TaskId| ids.iter().position(|t| *t == id).unwrap();
        assert!(position(TaskId::SetupEnvironment) < position(TaskId::SimulateTx));
        assert!(position(TaskId::SimulateTx) < position(TaskId::TraceAnalysis));
        assert!(position(TaskId::TraceAnalysis) < position(TaskId::AttackDetection));
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn no_static_analysis_without_calldata() {
        let (ordered, _) = order_tasks(canonical_tasks(false));
        assert!(ordered.iter().all(|t| t.id != TaskId::StaticAnalysis));
        assert_eq!(ordered.len(), 4);
    }

    #[test]
    fn parallel_groups_split_on_dependencies() {
        let (ordered, _) = order_tasks(canonical_tasks(true));
        let groups = group_parallel(&ordered);

        // Roots run together; each dependent task starts a new level.
        assert_eq!(groups.len(), 4);
        assert!(groups[0].contains(&TaskId::StaticAnalysis));
        assert!(groups[0].contains(&TaskId::SetupEnvironment));
        assert_eq!(groups[1], vec![TaskId::SimulateTx]);
        assert_eq!(groups[2], vec![TaskId::TraceAnalysis]);
        assert_eq!(groups[3], vec![TaskId::AttackDetection]);
    }

    #[test]
    fn unsatisfiable_dependency_recovers_by_priority() {
        let tasks = vec![
            PlanTask {
                id: TaskId::TraceAnalysis,
                action: CapabilityAction::ForensicsAnalyzeTrace,
                priority: TaskPriority::Medium,
                // Depends on a task that is not in the plan.
                depends_on: vec![TaskId::SimulateTx],
            },
            PlanTask {
                id: TaskId::AttackDetection,
                action: CapabilityAction::ForensicsDetectAttack,
                priority: TaskPriority::High,
                depends_on: vec![TaskId::TraceAnalysis],
            },
        ];
        let (ordered, warnings) = order_tasks(tasks);
        assert_eq!(ordered.len(), 2);
        // Both picks are forced: attack_detection wins on priority first,
        // then trace_analysis is forced in turn.
        assert_eq!(warnings.len(), 2);
        assert_eq!(ordered[0].id, TaskId::AttackDetection);
        assert_eq!(ordered[1].id, TaskId::TraceAnalysis);
    }
}
