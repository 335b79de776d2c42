//! Orchestrator：Plan → Validate → Execute → Evaluate → Replan 主控循环
//!
//! 独占持有 RunState，按阶段推进：生成计划、校验、调度执行；步骤最终失败时先请 Failure Reflector
//! 解释原因，再按 RecoveryEngine 的判断走局部修复或全局重规划，直到完成、预算耗尽、
//! 重规划次数用尽、目标被判定无法完成或被取消。每个阶段边界写检查点。

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::core::events::{emit, EventSender, RunEvent};
use crate::core::state::{NoteSource, RunReport, RunState, RunStatus, Terminal};
use crate::core::{OrchestratorError, RecoveryAction, RecoveryEngine};
use crate::llm::UsageMeter;
use crate::persistence::{checkpoint, CheckpointStore};
use crate::planning::{
    FailureReflector, PlanCandidate, PlanGenerator, PlanRequest, Reflection, ReflectionRequest,
    RepairMode, StepEvaluator,
};
use crate::tools::ToolExecutor;
use crate::workflow::artifacts::ArtifactStore;
use crate::workflow::budget::Budget;
use crate::workflow::reference::{refs_in_inputs, rename_step_refs};
use crate::workflow::scheduler::{RunOutcome, Scheduler, StepFailure};
use crate::workflow::types::{Plan, Step, StepId, StepStatus};
use crate::workflow::validator::{PlanValidator, Severity};

/// 主控循环所处阶段
#[derive(Debug)]
enum Phase {
    /// 请求 Plan Generator；Vec 为需要替换的失败步骤
    Generate(RepairMode, Vec<StepId>),
    Validate,
    Execute,
    Finish(Terminal),
}

/// 编排器：由 OrchestratorBuilder 构造
pub struct Orchestrator {
    pub(crate) generator: Arc<dyn PlanGenerator>,
    pub(crate) reflector: Arc<dyn FailureReflector>,
    pub(crate) evaluator: Option<Arc<dyn StepEvaluator>>,
    pub(crate) executor: Arc<ToolExecutor>,
    pub(crate) validator: PlanValidator,
    pub(crate) recovery: RecoveryEngine,
    /// 新运行的预算上限；恢复运行时用来放宽旧上限
    pub(crate) budget: Budget,
    pub(crate) replan_threshold: f64,
    pub(crate) oracle_timeout: Duration,
    pub(crate) checkpoints: Option<CheckpointStore>,
    pub(crate) cancel: CancellationToken,
    pub(crate) events: Option<EventSender>,
    /// 共享 LLM 的 token 增量，Plan Generator / Reflector / Critic 的消耗都记到运行预算上
    pub(crate) oracle_usage: Arc<UsageMeter>,
}

impl Orchestrator {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn checkpoint_store(&self) -> Option<&CheckpointStore> {
        self.checkpoints.as_ref()
    }

    /// 新建一次运行的状态（预算取自配置）
    pub fn new_state(&self, goal: impl Into<String>) -> RunState {
        RunState::new(goal, self.budget)
    }

    /// 从目标开始：让 Plan Generator 产出初始计划
    pub async fn run_goal(&self, goal: &str) -> Result<RunReport, OrchestratorError> {
        let mut state = self.new_state(goal);
        self.drive(&mut state, None).await
    }

    /// 跳过初始生成，直接使用给定计划（仍需通过校验）
    pub async fn run_with_plan(&self, goal: &str, plan: Plan) -> Result<RunReport, OrchestratorError> {
        let mut state = self.new_state(goal);
        self.drive(&mut state, Some(plan)).await
    }

    /// 从检查点恢复。未结束的运行重新校验后继续执行；因预算耗尽而结束的运行按当前配置放宽上限后继续；
    /// 其它已结束的运行直接返回报告
    pub async fn resume(&self, state: &mut RunState) -> Result<RunReport, OrchestratorError> {
        match state.terminal.clone() {
            Some(Terminal::PartialBudget { counter }) => {
                state.budget.raise_ceilings(&self.budget);
                if state.budget.can_start().is_err() {
                    tracing::info!(run_id = %state.run_id(), counter = %counter, "budget still exhausted, nothing to resume");
                    return Ok(state.report());
                }
                state.terminal = None;
                state.add_note(
                    NoteSource::Controller,
                    format!("resumed after {counter} budget was exhausted"),
                );
            }
            Some(_) => return Ok(state.report()),
            None => {}
        }
        state.plan.settle_running();
        tracing::info!(run_id = %state.run_id(), generation = state.plan.generation, "resuming run");
        self.drive(state, None).await
    }

    /// 驱动状态机直到终止。first 给出时作为初始计划安装
    pub async fn drive(&self, state: &mut RunState, first: Option<Plan>) -> Result<RunReport, OrchestratorError> {
        let mut phase = match first {
            Some(plan) => self.install(state, PlanCandidate::Plan(plan), RepairMode::Initial, &[]),
            None if state.plan.is_empty() => Phase::Generate(RepairMode::Initial, Vec::new()),
            None => Phase::Validate,
        };

        loop {
            if self.cancel.is_cancelled() && !matches!(phase, Phase::Finish(_)) {
                phase = Phase::Finish(Terminal::Cancelled);
            }
            phase = match phase {
                Phase::Generate(mode, failing) => self.generate(state, mode, failing).await,
                Phase::Validate => self.validate(state).await,
                Phase::Execute => self.execute(state).await?,
                Phase::Finish(terminal) => {
                    self.finish(state, terminal).await;
                    return Ok(state.report());
                }
            };
        }
    }

    async fn generate(&self, state: &mut RunState, mode: RepairMode, failing: Vec<StepId>) -> Phase {
        if mode == RepairMode::Initial {
            state.set_status(RunStatus::Planning);
        }
        let request = self.plan_request(state, mode, &failing);
        tracing::info!(mode = %mode, failing = ?failing, "requesting plan");
        let candidate = self
            .call_oracle("plan generator", self.generator.generate(&request))
            .await;
        self.charge_oracle_usage(state);
        match candidate {
            Ok(candidate) => self.install(state, candidate, mode, &failing),
            Err(OrchestratorError::Cancelled) => Phase::Finish(Terminal::Cancelled),
            Err(e) => {
                tracing::warn!(mode = %mode, error = %e, "plan generation failed");
                state.add_note(NoteSource::Generator, format!("plan generation failed: {e}"));
                self.replan(state, RepairMode::Global, Vec::new())
            }
        }
    }

    fn plan_request(&self, state: &RunState, mode: RepairMode, failing: &[StepId]) -> PlanRequest {
        let available_artifacts = state
            .artifacts
            .ids()
            .filter_map(|id| {
                state
                    .artifacts
                    .get(id)
                    .map(|a| (id.to_string(), a.fields.keys().cloned().collect()))
            })
            .collect();
        PlanRequest {
            goal: state.goal.clone(),
            tool_catalog: self.executor.catalog(),
            prior_plan: (!state.plan.is_empty()).then(|| state.plan.clone()),
            notes: state.note_messages(),
            mode,
            failing_steps: failing.to_vec(),
            frozen_steps: state.plan.completed_ids(),
            available_artifacts,
        }
    }

    /// 安装候选计划；局部补丁被拒绝时算一次局部修复失败
    fn install(&self, state: &mut RunState, candidate: PlanCandidate, mode: RepairMode, failing: &[StepId]) -> Phase {
        let plan = match candidate {
            PlanCandidate::Impossible { reason } => {
                tracing::info!(%reason, "goal judged impossible");
                state.add_note(NoteSource::Generator, format!("goal judged impossible: {reason}"));
                return Phase::Finish(Terminal::Impossible { reason });
            }
            PlanCandidate::Plan(plan) => plan,
        };

        match mode {
            RepairMode::Initial => {
                let mut plan = plan;
                plan.goal = state.goal.clone();
                plan.generation = state.plan.generation;
                plan.steps.iter_mut().for_each(|s| s.reset());
                state.plan = plan;
            }
            RepairMode::Global => {
                state.plan = carry_over_completed(&state.goal, &state.plan, &mut state.artifacts, plan);
            }
            RepairMode::Local => match merge_local_patch(&state.plan, plan, failing) {
                Ok(merged) => state.plan = merged,
                Err(reason) => {
                    state.local_repair_failures += 1;
                    tracing::info!(%reason, failures = state.local_repair_failures, "local repair rejected");
                    state.add_note(NoteSource::Controller, format!("local repair rejected: {reason}"));
                    let next = if self
                        .recovery
                        .local_repair_allowed(failing.len(), state.local_repair_failures)
                    {
                        RepairMode::Local
                    } else {
                        RepairMode::Global
                    };
                    return self.replan(state, next, failing.to_vec());
                }
            },
        }
        if mode != RepairMode::Initial {
            state.last_repair = Some(mode);
        }

        emit(
            self.events.as_ref(),
            RunEvent::PlanGenerated {
                generation: state.plan.generation,
                mode,
                steps: state.plan.len(),
            },
        );
        tracing::info!(generation = state.plan.generation, steps = state.plan.len(), mode = %mode, "plan installed");
        Phase::Validate
    }

    async fn validate(&self, state: &mut RunState) -> Phase {
        state.set_status(RunStatus::Validating);
        let report = self
            .validator
            .validate(&state.plan, &self.executor.catalog(), &state.budget);

        for issue in report.issues.iter().filter(|i| i.severity == Severity::Warning) {
            state.add_note(NoteSource::Validator, issue.to_note());
        }
        if report.ok {
            emit(
                self.events.as_ref(),
                RunEvent::PlanValidated {
                    generation: state.plan.generation,
                    steps: state.plan.len(),
                },
            );
            let label = format!("validated-g{}", state.plan.generation);
            checkpoint(self.checkpoints.as_ref(), state, &label, self.events.as_ref()).await;
            return Phase::Execute;
        }

        let issues: Vec<String> = report.errors().map(|i| i.to_note()).collect();
        tracing::info!(generation = state.plan.generation, issues = ?issues, "plan rejected");
        for issue in &issues {
            state.add_note(NoteSource::Validator, issue.clone());
        }
        emit(
            self.events.as_ref(),
            RunEvent::PlanRejected {
                generation: state.plan.generation,
                issues,
            },
        );
        self.replan(state, RepairMode::Global, Vec::new())
    }

    async fn execute(&self, state: &mut RunState) -> Result<Phase, OrchestratorError> {
        let outcome = self.scheduler().run(state).await?;
        let phase = match outcome {
            RunOutcome::Completed => Phase::Finish(Terminal::Completed),
            RunOutcome::BudgetExhausted { counter, .. } => Phase::Finish(Terminal::PartialBudget { counter }),
            RunOutcome::Cancelled => Phase::Finish(Terminal::Cancelled),
            RunOutcome::CriteriaNotMet { step_id, evaluation } => {
                tracing::info!(step = %step_id, confidence = evaluation.confidence, "criteria not met, replanning");
                self.replan(state, RepairMode::Global, vec![step_id])
            }
            RunOutcome::Stalled { pending } => {
                state.add_note(
                    NoteSource::Controller,
                    format!("no step can start; stuck steps: {}", pending.join(", ")),
                );
                self.replan(state, RepairMode::Global, pending)
            }
            RunOutcome::StepFailed { failures, blocked } => {
                if !self.reflect_failures(state, &failures).await {
                    return Ok(Phase::Finish(Terminal::Cancelled));
                }
                if !blocked.is_empty() {
                    state.add_note(
                        NoteSource::Controller,
                        format!("blocked by failed steps: {}", blocked.join(", ")),
                    );
                }
                if state.last_repair == Some(RepairMode::Local) {
                    state.local_repair_failures += 1;
                }
                let kinds: Vec<_> = failures.iter().map(|f| f.kind).collect();
                let mode = match self
                    .recovery
                    .repair_for_failures(&kinds, state.local_repair_failures)
                {
                    RecoveryAction::LocalRepair => RepairMode::Local,
                    _ => RepairMode::Global,
                };
                let failing = failures.into_iter().map(|f| f.step_id).collect();
                self.replan(state, mode, failing)
            }
        };
        Ok(phase)
    }

    /// 每个失败步骤调用一次 Failure Reflector；返回 false 表示期间被取消
    async fn reflect_failures(&self, state: &mut RunState, failures: &[StepFailure]) -> bool {
        for failure in failures {
            let step_description = state
                .plan
                .step(&failure.step_id)
                .map(|s| s.describe())
                .unwrap_or_else(|| failure.step_id.clone());
            let request = ReflectionRequest {
                step_description,
                error_message: failure.error.clone(),
                context: reflection_context(state),
            };
            let reflection = self
                .call_oracle("failure reflector", self.reflector.reflect(&request))
                .await;
            self.charge_oracle_usage(state);
            let reflection = match reflection {
                Ok(reflection) => reflection,
                Err(OrchestratorError::Cancelled) => return false,
                Err(e) => {
                    tracing::warn!(step = %failure.step_id, error = %e, "reflection failed, using raw error");
                    Reflection::fallback(&failure.error)
                }
            };
            state.add_note(NoteSource::Reflector, reflection.to_note(&failure.step_id));
            emit(
                self.events.as_ref(),
                RunEvent::Reflection {
                    step_id: failure.step_id.clone(),
                    root_cause: reflection.root_cause.clone(),
                },
            );
            state.reflections.insert(failure.step_id.clone(), reflection);
        }
        true
    }

    /// 申请一次重规划；次数用尽则终止
    fn replan(&self, state: &mut RunState, mode: RepairMode, failing: Vec<StepId>) -> Phase {
        if !self.recovery.can_replan(state.replans) {
            tracing::info!(replans = state.replans, "replan limit reached");
            state.add_note(
                NoteSource::Controller,
                format!("replan limit reached after {} replan(s)", state.replans),
            );
            return Phase::Finish(Terminal::ReplanLimitExceeded);
        }
        state.replans += 1;
        state.set_status(RunStatus::Replanning);
        emit(
            self.events.as_ref(),
            RunEvent::Replanning {
                mode,
                replans: state.replans,
            },
        );
        tracing::info!(mode = %mode, replans = state.replans, "replanning");
        Phase::Generate(mode, failing)
    }

    async fn finish(&self, state: &mut RunState, terminal: Terminal) {
        match &terminal {
            Terminal::Cancelled => state.add_note(NoteSource::Controller, "run cancelled"),
            Terminal::PartialBudget { counter } => state.add_note(
                NoteSource::Controller,
                format!("{counter} budget exhausted, returning partial results"),
            ),
            _ => {}
        }
        state.plan.settle_running();
        state.set_status(terminal.status());
        state.terminal = Some(terminal);
        checkpoint(self.checkpoints.as_ref(), state, "final", self.events.as_ref()).await;
        emit(
            self.events.as_ref(),
            RunEvent::Finished {
                status: state.status,
            },
        );
        tracing::info!(run_id = %state.run_id(), terminal = ?state.terminal, replans = state.replans, "run finished");
    }

    fn scheduler(&self) -> Scheduler {
        let mut scheduler = Scheduler::new(self.executor.clone(), self.cancel.clone());
        if let Some(evaluator) = &self.evaluator {
            scheduler = scheduler.with_evaluator(evaluator.clone(), self.replan_threshold);
        }
        if let Some(events) = &self.events {
            scheduler = scheduler.with_events(events.clone());
        }
        if let Some(store) = &self.checkpoints {
            scheduler = scheduler.with_checkpoints(store.clone());
        }
        scheduler.with_oracle_usage(self.oracle_usage.clone())
    }

    fn charge_oracle_usage(&self, state: &mut RunState) {
        let tokens = self.oracle_usage.take();
        if tokens == 0 {
            return;
        }
        let charge = state.budget.charge_tokens(tokens);
        tracing::debug!(tokens, overflowed = ?charge.overflowed, "oracle tokens charged");
    }

    /// 调用外部 oracle（Plan Generator / Failure Reflector）：带超时，可被取消
    async fn call_oracle<T, F>(&self, name: &str, fut: F) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<T, OrchestratorError>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(OrchestratorError::Cancelled),
            result = tokio::time::timeout(self.oracle_timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(OrchestratorError::OracleTimeout(name.to_string())),
            },
        }
    }
}

fn reflection_context(state: &RunState) -> String {
    let completed = state.plan.completed_ids();
    let mut context = format!("Goal: {}\n", state.goal);
    if !completed.is_empty() {
        context.push_str(&format!("Completed steps: {}\n", completed.join(", ")));
    }
    let recent: Vec<String> = state.notes.iter().rev().take(5).rev().map(|n| n.to_string()).collect();
    if !recent.is_empty() {
        context.push_str("Recent notes:\n");
        for note in recent {
            context.push_str(&format!("- {note}\n"));
        }
    }
    context
}

/// 一个步骤指向的其它步骤：deps 加上 inputs 里的 `$step.` 引用
fn linked_steps(step: &Step) -> Vec<StepId> {
    step.deps
        .iter()
        .cloned()
        .chain(refs_in_inputs(&step.inputs).into_iter().map(|r| r.step_id))
        .collect()
}

/// 全局重规划：同 id 同工具且已有产出的步骤保持完成；同 id 换了工具的旧产出作废；
/// 新计划（直接或经由已完成步骤间接）指向、但自身未声明的已完成步骤原样放回计划开头
pub fn carry_over_completed(goal: &str, current: &Plan, artifacts: &mut ArtifactStore, new_plan: Plan) -> Plan {
    let mut steps = Vec::with_capacity(new_plan.steps.len());
    for mut step in new_plan.steps {
        step.reset();
        let previous = current.step(&step.id);
        let reusable = previous.is_some_and(|old| old.status == StepStatus::Completed && old.tool == step.tool)
            && artifacts.contains(&step.id);
        if reusable {
            step.status = StepStatus::Completed;
            step.attempts = previous.map(|old| old.attempts).unwrap_or(0);
        } else if artifacts.invalidate(&step.id).is_some() {
            tracing::debug!(step = %step.id, "artifact invalidated by replan");
        }
        steps.push(step);
    }

    let declared: BTreeSet<StepId> = steps.iter().map(|s| s.id.clone()).collect();
    let mut wanted: Vec<StepId> = steps.iter().flat_map(linked_steps).collect();
    let mut carried: BTreeSet<StepId> = BTreeSet::new();
    while let Some(id) = wanted.pop() {
        if declared.contains(&id) || carried.contains(&id) {
            continue;
        }
        let Some(old) = current.step(&id) else {
            continue;
        };
        if old.status != StepStatus::Completed || !artifacts.contains(&id) {
            continue;
        }
        wanted.extend(linked_steps(old));
        carried.insert(id);
    }
    let carried_steps = current.steps.iter().filter(|s| carried.contains(&s.id)).cloned();

    let mut plan = Plan::new(goal, carried_steps.chain(steps).collect());
    plan.generation = current.generation + 1;
    plan
}

/// 局部修复：用补丁替换失败步骤（放在第一个失败步骤的位置），其余步骤原样保留。
/// 补丁换掉了一个仍被下游使用的失败步骤 id 时，若补丁里恰好有一个新的末端步骤，下游的 deps 与引用改指向它；
/// 补丁为空、触碰了非失败的已有步骤、或改名无法唯一对应时拒绝
pub fn merge_local_patch(current: &Plan, patch: Plan, failing: &[StepId]) -> Result<Plan, String> {
    if patch.is_empty() {
        return Err("replacement plan has no steps".to_string());
    }
    if let Some(step) = patch
        .steps
        .iter()
        .find(|s| current.contains(&s.id) && !failing.contains(&s.id))
    {
        return Err(format!("step '{}' is not failing and must not change", step.id));
    }

    let kept: Vec<&Step> = current.steps.iter().filter(|s| !failing.contains(&s.id)).collect();
    let dropped: Vec<&StepId> = failing
        .iter()
        .filter(|id| !patch.contains(id))
        .filter(|id| kept.iter().any(|s| linked_steps(s).contains(id)))
        .collect();
    let rename = match dropped.as_slice() {
        [] => None,
        [old] => {
            let sinks: Vec<&Step> = patch
                .steps
                .iter()
                .filter(|s| !current.contains(&s.id))
                .filter(|s| !patch.steps.iter().any(|o| linked_steps(o).contains(&s.id)))
                .collect();
            match sinks.as_slice() {
                [new] => Some(((*old).clone(), new.id.clone())),
                _ => {
                    return Err(format!(
                        "replacement drops failing step '{old}' that later steps use; keep its id"
                    ))
                }
            }
        }
        many => {
            let ids: Vec<&str> = many.iter().map(|id| id.as_str()).collect();
            return Err(format!(
                "replacement drops failing steps {} that later steps use; keep their ids",
                ids.join(", ")
            ));
        }
    };

    let mut replacement: Vec<_> = patch.steps;
    replacement.iter_mut().for_each(|s| s.reset());
    let mut replacement = Some(replacement);
    let mut steps = Vec::with_capacity(current.len());
    for step in &current.steps {
        if failing.contains(&step.id) {
            if let Some(patch_steps) = replacement.take() {
                steps.extend(patch_steps);
            }
            continue;
        }
        let mut step = step.clone();
        if let Some((old, new)) = &rename {
            for dep in step.deps.iter_mut().filter(|d| d.as_str() == old.as_str()) {
                *dep = new.clone();
            }
            step.inputs
                .values_mut()
                .for_each(|v| rename_step_refs(v, old, new));
        }
        steps.push(step);
    }
    if let Some(patch_steps) = replacement {
        steps.extend(patch_steps);
    }
    if let Some((old, new)) = &rename {
        tracing::info!(from = %old, to = %new, "local repair renamed a failing step");
    }

    let mut plan = Plan::new(current.goal.clone(), steps);
    plan.generation = current.generation + 1;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::OrchestratorBuilder;
    use crate::llm::ScriptedLlmClient;
    use crate::planning::LlmPlanGenerator;
    use crate::tools::{EchoTool, ToolRegistry};
    use crate::workflow::builder::PlanBuilder;
    use serde_json::{json, Map};

    fn artifact_store(ids: &[&str]) -> ArtifactStore {
        let mut store = ArtifactStore::new();
        for id in ids {
            let mut fields = Map::new();
            fields.insert("text".into(), json!(id));
            store.put(id, fields, 0).unwrap();
        }
        store
    }

    fn completed(mut plan: Plan, ids: &[&str]) -> Plan {
        for id in ids {
            if let Some(step) = plan.step_mut(id) {
                step.status = StepStatus::Completed;
            }
        }
        plan
    }

    #[test]
    fn test_carry_over_keeps_same_tool_and_invalidates_changed_tool() {
        let current = completed(
            PlanBuilder::new("g").step("a", "echo").step("b", "read_file").build(),
            &["a", "b"],
        );
        let mut artifacts = artifact_store(&["a", "b"]);
        let new_plan = PlanBuilder::new("g")
            .step("a", "echo")
            .step("b", "list_dir")
            .sequential("a", "b")
            .build();

        let plan = carry_over_completed("g", &current, &mut artifacts, new_plan);
        assert_eq!(plan.status_of("a"), Some(StepStatus::Completed));
        assert_eq!(plan.status_of("b"), Some(StepStatus::Pending));
        assert!(artifacts.contains("a"));
        assert!(!artifacts.contains("b"));
        assert_eq!(plan.generation, 1);
    }

    #[test]
    fn test_carry_over_prepends_referenced_completed_steps() {
        let current = completed(
            PlanBuilder::new("g").step("fetch", "echo").step("use", "echo").build(),
            &["fetch"],
        );
        let mut artifacts = artifact_store(&["fetch"]);
        let new_plan = PlanBuilder::new("g")
            .step("use2", "echo")
            .input("use2", "text", "$fetch.text")
            .depends_on("use2", ["fetch"])
            .build();

        let plan = carry_over_completed("g", &current, &mut artifacts, new_plan);
        assert_eq!(plan.ids(), vec!["fetch", "use2"]);
        assert_eq!(plan.status_of("fetch"), Some(StepStatus::Completed));
    }

    #[test]
    fn test_local_patch_replaces_failing_step_in_place() {
        let mut current = completed(
            PlanBuilder::new("g")
                .step("a", "echo")
                .step("b", "read_file")
                .step("c", "echo")
                .sequential("a", "b")
                .sequential("b", "c")
                .build(),
            &["a"],
        );
        current.step_mut("b").unwrap().status = StepStatus::Failed;
        let patch = PlanBuilder::new("g")
            .step("b", "list_dir")
            .depends_on("b", ["a"])
            .build();

        let merged = merge_local_patch(&current, patch, &["b".to_string()]).unwrap();
        assert_eq!(merged.ids(), vec!["a", "b", "c"]);
        assert_eq!(merged.step("b").unwrap().tool, "list_dir");
        assert_eq!(merged.status_of("b"), Some(StepStatus::Pending));
        assert_eq!(merged.status_of("a"), Some(StepStatus::Completed));
        assert_eq!(merged.generation, current.generation + 1);
    }

    #[test]
    fn test_carry_over_follows_completed_chain() {
        let mut current = completed(
            PlanBuilder::new("g")
                .step("a", "echo")
                .step("b", "echo")
                .input("b", "text", "$a.text")
                .depends_on("b", ["a"])
                .step("c", "read_file")
                .depends_on("c", ["b"])
                .build(),
            &["a", "b"],
        );
        current.step_mut("c").unwrap().status = StepStatus::Failed;
        let mut artifacts = artifact_store(&["a", "b"]);
        let new_plan = PlanBuilder::new("g")
            .step("d", "echo")
            .input("d", "text", "$b.text")
            .depends_on("d", ["b"])
            .build();

        let plan = carry_over_completed("g", &current, &mut artifacts, new_plan);
        assert_eq!(plan.ids(), vec!["a", "b", "d"]);
        assert_eq!(plan.status_of("a"), Some(StepStatus::Completed));
        assert_eq!(plan.status_of("b"), Some(StepStatus::Completed));
        let report = PlanValidator::default().validate(
            &plan,
            &crate::tools::ToolCatalog::from_names(["echo", "read_file"]),
            &Budget::unlimited(),
        );
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn test_local_patch_with_new_id_rewires_downstream() {
        let mut current = completed(
            PlanBuilder::new("g")
                .step("a", "echo")
                .step("b", "read_file")
                .depends_on("b", ["a"])
                .step("c", "echo")
                .input("c", "text", "$b.text")
                .depends_on("c", ["b"])
                .build(),
            &["a"],
        );
        current.step_mut("b").unwrap().status = StepStatus::Failed;
        let patch = PlanBuilder::new("g")
            .step("b_fixed", "echo")
            .depends_on("b_fixed", ["a"])
            .build();

        let merged = merge_local_patch(&current, patch, &["b".to_string()]).unwrap();
        assert_eq!(merged.ids(), vec!["a", "b_fixed", "c"]);
        let c = merged.step("c").unwrap();
        assert_eq!(c.deps, vec!["b_fixed"]);
        assert_eq!(c.inputs["text"], json!("$b_fixed.text"));
        let report = PlanValidator::default().validate(
            &merged,
            &crate::tools::ToolCatalog::from_names(["echo", "read_file"]),
            &Budget::unlimited(),
        );
        assert!(report.ok, "{:?}", report.issues);
    }

    #[test]
    fn test_local_patch_rejects_ambiguous_rename() {
        let current = PlanBuilder::new("g")
            .step("a", "echo")
            .step("b", "echo")
            .step("c", "echo")
            .depends_on("c", ["a", "b"])
            .build();
        let patch = PlanBuilder::new("g")
            .step("a2", "echo")
            .step("b2", "echo")
            .build();
        let failing = vec!["a".to_string(), "b".to_string()];
        let err = merge_local_patch(&current, patch, &failing).unwrap_err();
        assert!(err.contains("keep their ids"));
    }

    #[test]
    fn test_local_patch_rejects_touching_other_steps() {
        let current = completed(
            PlanBuilder::new("g").step("a", "echo").step("b", "echo").build(),
            &["a"],
        );
        let patch = PlanBuilder::new("g").step("a", "echo").build();
        assert!(merge_local_patch(&current, patch, &["b".to_string()]).is_err());
        let empty = PlanBuilder::new("g").build();
        assert!(merge_local_patch(&current, empty, &["b".to_string()]).is_err());
    }

    fn orchestrator(replies: Vec<&str>) -> Orchestrator {
        let llm = Arc::new(ScriptedLlmClient::new(replies));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        OrchestratorBuilder::new()
            .with_generator(Arc::new(LlmPlanGenerator::new(llm.clone())))
            .with_registry(registry)
            .with_llm(llm)
            .without_evaluator()
            .without_checkpoints()
            .build()
    }

    #[tokio::test]
    async fn test_hallucinated_tool_rejected_then_replanned() {
        let orch = orchestrator(vec![
            r#"{"steps": [{"id": "a", "tool": "teleport"}]}"#,
            r#"{"steps": [{"id": "a", "tool": "echo", "inputs": {"text": "hi"}}]}"#,
        ]);
        let report = orch.run_goal("say hi").await.unwrap();
        assert_eq!(report.terminal, Some(Terminal::Completed));
        assert_eq!(report.replans, 1);
        assert_eq!(report.generation, 1);
        assert!(report.notes.iter().any(|n| n.contains("teleport")));
    }

    #[tokio::test]
    async fn test_impossible_goal_terminates() {
        let orch = orchestrator(vec![r#"{"complexity": "impossible", "reason": "no flights"}"#]);
        let report = orch.run_goal("book a flight").await.unwrap();
        assert_eq!(
            report.terminal,
            Some(Terminal::Impossible {
                reason: "no flights".into()
            })
        );
        assert_eq!(report.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_replan_limit_exceeded() {
        let bad = r#"{"steps": [{"id": "a", "tool": "teleport"}]}"#;
        let orch = orchestrator(vec![bad; 5]);
        let report = orch.run_goal("g").await.unwrap();
        assert_eq!(report.terminal, Some(Terminal::ReplanLimitExceeded));
        assert_eq!(report.replans, 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let orch = orchestrator(vec![r#"{"steps": [{"id": "a", "tool": "echo"}]}"#]);
        orch.cancel_token().cancel();
        let report = orch.run_goal("g").await.unwrap();
        assert_eq!(report.terminal, Some(Terminal::Cancelled));
        assert!(report.notes.iter().any(|n| n.contains("cancelled")));
    }

    #[tokio::test]
    async fn test_resume_finished_run_returns_report() {
        let orch = orchestrator(vec![]);
        let mut state = orch.new_state("g");
        state.terminal = Some(Terminal::Completed);
        state.status = RunStatus::Done;
        let report = orch.resume(&mut state).await.unwrap();
        assert_eq!(report.terminal, Some(Terminal::Completed));
    }
}
