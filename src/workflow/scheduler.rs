//! 调度执行器
//!
//! 单线程协作式循环：按声明顺序取第一个 ready 步骤，解析 `$step.field` 引用，带超时与取消调用工具，
//! 每次尝试后扣减预算，由纯函数 decide 决定重试 / 完成 / 失败 / 停下。
//! 预算只在步骤之间检查，进行中的步骤不会被预算打断。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::core::events::{emit, EventSender, RunEvent};
use crate::core::state::{NoteSource, RunState, RunStatus};
use crate::core::{ErrorKind, OrchestratorError};
use crate::llm::UsageMeter;
use crate::persistence::{checkpoint, CheckpointStore};
use crate::planning::{Evaluation, EvaluationAction, StepEvaluator};
use crate::tools::{ToolExecutor, ToolReply};
use crate::workflow::budget::{Budget, BudgetKind};
use crate::workflow::graph::blocked_steps;
use crate::workflow::reference::resolve_inputs;
use crate::workflow::types::{StepId, StepStatus};

/// 默认的「强制重规划」置信度阈值
pub const DEFAULT_REPLAN_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// 单次尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success {
        output: Map<String, Value>,
        tokens_used: u64,
    },
    RetryableFailure { kind: ErrorKind, error: String },
    FatalFailure { kind: ErrorKind, error: String },
}

impl StepOutcome {
    pub fn error(&self) -> Option<(&ErrorKind, &str)> {
        match self {
            StepOutcome::Success { .. } => None,
            StepOutcome::RetryableFailure { kind, error } | StepOutcome::FatalFailure { kind, error } => {
                Some((kind, error.as_str()))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Retry,
    Complete,
    Fail,
    /// 还能重试但预算耗尽：步骤回到 pending
    Halt(BudgetKind),
}

/// 重试决策：attempts 为已做的尝试次数（含本次）
pub fn decide(outcome: &StepOutcome, attempts: u32, max_retries: u32, budget: &Budget) -> StepDecision {
    match outcome {
        StepOutcome::Success { .. } => StepDecision::Complete,
        StepOutcome::FatalFailure { .. } => StepDecision::Fail,
        StepOutcome::RetryableFailure { .. } => {
            if attempts > max_retries {
                StepDecision::Fail
            } else if let Err(kind) = budget.can_start() {
                StepDecision::Halt(kind)
            } else {
                StepDecision::Retry
            }
        }
    }
}

/// 评估结论到执行动作的映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationVerdict {
    Accept,
    RetryStep,
    Replan,
}

pub fn evaluation_verdict(evaluation: &Evaluation, retries_remain: bool, threshold: f64) -> EvaluationVerdict {
    if evaluation.success {
        return EvaluationVerdict::Accept;
    }
    match evaluation.action {
        EvaluationAction::Retry if retries_remain => EvaluationVerdict::RetryStep,
        EvaluationAction::Replan if evaluation.confidence >= threshold => EvaluationVerdict::Replan,
        _ => EvaluationVerdict::Accept,
    }
}

/// 步骤最终失败
#[derive(Debug, Clone, PartialEq)]
pub struct StepFailure {
    pub step_id: StepId,
    pub kind: ErrorKind,
    pub error: String,
    pub attempts: u32,
}

/// run_step 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum StepReport {
    Completed,
    Failed(StepFailure),
    Halted(BudgetKind),
    Cancelled,
    /// 结果不满足条件且评估器高置信度要求重规划
    CriteriaNotMet(Evaluation),
}

/// run 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// 部分完成；pending 为尚未执行的步骤
    BudgetExhausted {
        counter: BudgetKind,
        pending: Vec<StepId>,
    },
    /// 有步骤最终失败；blocked 为因此永远无法就绪的步骤
    StepFailed {
        failures: Vec<StepFailure>,
        blocked: Vec<StepId>,
    },
    CriteriaNotMet {
        step_id: StepId,
        evaluation: Evaluation,
    },
    Cancelled,
    /// 没有 ready 步骤也没有失败（计划本身不可达）
    Stalled { pending: Vec<StepId> },
}

/// 本轮开始前就已失败的步骤（例如从检查点恢复）
fn earlier_failures(state: &RunState) -> Vec<StepFailure> {
    state
        .plan
        .steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .map(|s| StepFailure {
            step_id: s.id.clone(),
            kind: ErrorKind::ToolError,
            error: s.last_error.clone().unwrap_or_default(),
            attempts: s.attempts,
        })
        .collect()
}

/// 调度执行器
pub struct Scheduler {
    executor: Arc<ToolExecutor>,
    evaluator: Option<Arc<dyn StepEvaluator>>,
    replan_threshold: f64,
    cancel: CancellationToken,
    events: Option<EventSender>,
    checkpoints: Option<CheckpointStore>,
    oracle_usage: Option<Arc<UsageMeter>>,
}

impl Scheduler {
    pub fn new(executor: Arc<ToolExecutor>, cancel: CancellationToken) -> Self {
        Self {
            executor,
            evaluator: None,
            replan_threshold: DEFAULT_REPLAN_CONFIDENCE_THRESHOLD,
            cancel,
            events: None,
            checkpoints: None,
            oracle_usage: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn StepEvaluator>, replan_threshold: f64) -> Self {
        self.evaluator = Some(evaluator);
        self.replan_threshold = replan_threshold;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// 评估器消耗的 LLM token 计入运行预算
    pub fn with_oracle_usage(mut self, meter: Arc<UsageMeter>) -> Self {
        self.oracle_usage = Some(meter);
        self
    }

    /// 执行计划直到完成、失败、预算耗尽或取消。失败后仍继续执行其它独立的 ready 步骤
    pub async fn run(&self, state: &mut RunState) -> Result<RunOutcome, OrchestratorError> {
        state.set_status(RunStatus::Executing);
        let mut failures: Vec<StepFailure> = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let next = state.plan.ready_steps().first().map(|s| s.id.clone());
            let Some(step_id) = next else {
                if state.plan.is_complete() {
                    return Ok(RunOutcome::Completed);
                }
                if failures.is_empty() {
                    failures = earlier_failures(state);
                }
                if !failures.is_empty() {
                    return Ok(RunOutcome::StepFailed {
                        blocked: blocked_steps(&state.plan),
                        failures,
                    });
                }
                return Ok(RunOutcome::Stalled {
                    pending: state.plan.ids_with_status(StepStatus::Pending),
                });
            };

            if let Err(counter) = state.budget.can_start() {
                return Ok(self.budget_exhausted(state, counter));
            }

            match self.run_step(state, &step_id).await? {
                StepReport::Completed => {}
                StepReport::Failed(failure) => failures.push(failure),
                StepReport::Halted(counter) => return Ok(self.budget_exhausted(state, counter)),
                StepReport::Cancelled => return Ok(RunOutcome::Cancelled),
                StepReport::CriteriaNotMet(evaluation) => {
                    return Ok(RunOutcome::CriteriaNotMet { step_id, evaluation });
                }
            }
        }
    }

    fn budget_exhausted(&self, state: &RunState, counter: BudgetKind) -> RunOutcome {
        tracing::info!(counter = %counter, "budget exhausted, stopping between steps");
        emit(self.events.as_ref(), RunEvent::BudgetExhausted { counter });
        RunOutcome::BudgetExhausted {
            counter,
            pending: state.plan.ids_with_status(StepStatus::Pending),
        }
    }

    /// 执行一个步骤（含重试与评估），完成或最终失败后写检查点 `step-<id>`
    pub async fn run_step(&self, state: &mut RunState, step_id: &str) -> Result<StepReport, OrchestratorError> {
        let report = self.run_step_inner(state, step_id).await?;
        if matches!(
            report,
            StepReport::Completed | StepReport::Failed(_) | StepReport::CriteriaNotMet(_)
        ) {
            checkpoint(
                self.checkpoints.as_ref(),
                state,
                &format!("step-{step_id}"),
                self.events.as_ref(),
            )
            .await;
        }
        Ok(report)
    }

    async fn run_step_inner(&self, state: &mut RunState, step_id: &str) -> Result<StepReport, OrchestratorError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(StepReport::Cancelled);
            }
            if let Err(counter) = state.budget.can_start() {
                return Ok(StepReport::Halted(counter));
            }

            let (tool, attempt) = {
                let step = state
                    .plan
                    .step_mut(step_id)
                    .ok_or_else(|| OrchestratorError::UnknownStep(step_id.to_string()))?;
                step.status = StepStatus::Running;
                step.attempts += 1;
                (step.tool.clone(), step.attempts)
            };
            emit(
                self.events.as_ref(),
                RunEvent::StepStarted {
                    step_id: step_id.to_string(),
                    tool,
                    attempt,
                },
            );

            let outcome = match self.attempt_step(state, step_id).await {
                Ok(outcome) => outcome,
                Err(OrchestratorError::Cancelled) => {
                    self.set_status(state, step_id, StepStatus::Pending);
                    return Ok(StepReport::Cancelled);
                }
                Err(e) => return Err(e),
            };

            let outcome = match outcome {
                StepOutcome::Success { output, .. } => match self.evaluate(state, step_id, &output).await {
                    Err(OrchestratorError::Cancelled) => {
                        self.set_status(state, step_id, StepStatus::Pending);
                        return Ok(StepReport::Cancelled);
                    }
                    Err(e) => return Err(e),
                    Ok(Verdict::Accept) => {
                        let generation = state.plan.generation;
                        state.artifacts.put(step_id, output, generation)?;
                        if let Some(step) = state.plan.step_mut(step_id) {
                            step.status = StepStatus::Completed;
                            step.last_error = None;
                        }
                        tracing::info!(step = %step_id, "step completed");
                        emit(
                            self.events.as_ref(),
                            RunEvent::StepSucceeded {
                                step_id: step_id.to_string(),
                            },
                        );
                        return Ok(StepReport::Completed);
                    }
                    Ok(Verdict::Replan(evaluation)) => {
                        let summary = evaluation.summary();
                        if let Some(step) = state.plan.step_mut(step_id) {
                            step.status = StepStatus::Failed;
                            step.last_error = Some(summary.clone());
                        }
                        state.add_note(NoteSource::Evaluator, format!("step '{step_id}': {summary}"));
                        return Ok(StepReport::CriteriaNotMet(evaluation));
                    }
                    Ok(Verdict::RetryStep(evaluation)) => StepOutcome::RetryableFailure {
                        kind: ErrorKind::CriteriaNotMet,
                        error: evaluation.summary(),
                    },
                },
                failure => failure,
            };

            let (attempts, max_retries) = state
                .plan
                .step(step_id)
                .map(|s| (s.attempts, s.max_retries))
                .unwrap_or((0, 0));
            let decision = decide(&outcome, attempts, max_retries, &state.budget);
            let Some((kind, error)) = outcome.error().map(|(k, e)| (*k, e.to_string())) else {
                continue;
            };
            tracing::info!(step = %step_id, attempt = attempts, kind = %kind, error = %error, decision = ?decision, "step attempt failed");
            emit(
                self.events.as_ref(),
                RunEvent::StepFailed {
                    step_id: step_id.to_string(),
                    error: error.clone(),
                    will_retry: decision == StepDecision::Retry,
                },
            );
            if let Some(step) = state.plan.step_mut(step_id) {
                step.last_error = Some(error.clone());
            }

            match decision {
                StepDecision::Retry => {
                    self.set_status(state, step_id, StepStatus::Pending);
                }
                StepDecision::Halt(counter) => {
                    self.set_status(state, step_id, StepStatus::Pending);
                    return Ok(StepReport::Halted(counter));
                }
                StepDecision::Fail | StepDecision::Complete => {
                    self.set_status(state, step_id, StepStatus::Failed);
                    state.add_note(
                        NoteSource::Executor,
                        format!("step '{step_id}' failed after {attempts} attempt(s) [{kind}]: {error}"),
                    );
                    return Ok(StepReport::Failed(StepFailure {
                        step_id: step_id.to_string(),
                        kind,
                        error,
                        attempts,
                    }));
                }
            }
        }
    }

    /// 一次尝试：解析引用、调用工具、扣减预算。仅取消返回 Err
    pub async fn attempt_step(&self, state: &mut RunState, step_id: &str) -> Result<StepOutcome, OrchestratorError> {
        let step = state
            .plan
            .step(step_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownStep(step_id.to_string()))?;
        let start = Instant::now();

        let args = match resolve_inputs(&step.inputs, &state.artifacts) {
            Ok(args) => args,
            Err(e) => {
                state.budget.charge_attempt(start.elapsed(), 0);
                return Ok(StepOutcome::RetryableFailure {
                    kind: ErrorKind::UnresolvedReference,
                    error: e.to_string(),
                });
            }
        };
        let resolved = Value::Object(args.clone());
        tracing::debug!(step = %step_id, args = %resolved, "inputs resolved");

        let reply = self
            .executor
            .execute(
                &step.tool,
                Value::Object(args),
                step.timeout_s.map(Duration::from_secs),
                &self.cancel,
            )
            .await?;

        let tokens = reply.tokens_used();
        let outcome = match reply {
            ToolReply::Ok { fields, tokens_used } => StepOutcome::Success {
                output: fields,
                tokens_used,
            },
            ToolReply::Error(failure) => {
                let kind = if failure.error_type == "unknown_tool" {
                    ErrorKind::HallucinatedTool
                } else {
                    ErrorKind::ToolError
                };
                let error = format!("{}: {}", failure.error_type, failure.message);
                if failure.retry_possible {
                    StepOutcome::RetryableFailure { kind, error }
                } else {
                    StepOutcome::FatalFailure { kind, error }
                }
            }
        };

        let charge = state.budget.charge_attempt(start.elapsed(), tokens);
        if !charge.overflowed.is_empty() {
            tracing::debug!(step = %step_id, overflowed = ?charge.overflowed, "budget ceiling reached");
        }
        Ok(outcome)
    }

    /// 成功结果的评估；评估器出错时按通过处理并记 note
    async fn evaluate(
        &self,
        state: &mut RunState,
        step_id: &str,
        output: &Map<String, Value>,
    ) -> Result<Verdict, OrchestratorError> {
        let Some(evaluator) = &self.evaluator else {
            return Ok(Verdict::Accept);
        };
        let Some(step) = state.plan.step(step_id).cloned() else {
            return Err(OrchestratorError::UnknownStep(step_id.to_string()));
        };
        if !evaluator.should_evaluate(&step) {
            return Ok(Verdict::Accept);
        }

        state.set_status(RunStatus::Evaluating);
        let evaluation = tokio::select! {
            _ = self.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            r = evaluator.evaluate(&state.goal, &step, output) => r,
        };
        state.set_status(RunStatus::Executing);
        if let Some(meter) = &self.oracle_usage {
            state.budget.charge_tokens(meter.take());
        }

        let evaluation = match evaluation {
            Ok(evaluation) => evaluation,
            Err(e) => {
                tracing::warn!(step = %step_id, error = %e, "evaluator unavailable, accepting result");
                state.add_note(NoteSource::Evaluator, format!("step '{step_id}' not evaluated: {e}"));
                Evaluation::lenient()
            }
        };
        emit(
            self.events.as_ref(),
            RunEvent::Evaluated {
                step_id: step_id.to_string(),
                success: evaluation.success,
                action: evaluation.action,
                confidence: evaluation.confidence,
            },
        );

        let retries_remain = step.attempts <= step.max_retries;
        Ok(match evaluation_verdict(&evaluation, retries_remain, self.replan_threshold) {
            EvaluationVerdict::Accept => {
                if !evaluation.success {
                    state.add_note(
                        NoteSource::Evaluator,
                        format!("step '{step_id}' accepted despite: {}", evaluation.summary()),
                    );
                }
                Verdict::Accept
            }
            EvaluationVerdict::RetryStep => Verdict::RetryStep(evaluation),
            EvaluationVerdict::Replan => Verdict::Replan(evaluation),
        })
    }

    fn set_status(&self, state: &mut RunState, step_id: &str, status: StepStatus) {
        if let Some(step) = state.plan.step_mut(step_id) {
            step.status = status;
        }
    }
}

/// evaluate 的内部结果，携带评估详情
enum Verdict {
    Accept,
    RetryStep(Evaluation),
    Replan(Evaluation),
}
