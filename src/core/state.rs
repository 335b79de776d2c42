//! Run State：一次运行的全部状态
//!
//! 由 Orchestrator 独占持有并以 `&mut` 传给各组件；检查点保存的就是它。
//! RunReport 是它对用户的投影。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::planning::{Reflection, RepairMode};
use crate::workflow::artifacts::ArtifactStore;
use crate::workflow::budget::{Budget, BudgetKind};
use crate::workflow::types::{Plan, StepId, StepStatus};

/// 运行阶段
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Planning,
    Validating,
    Executing,
    Evaluating,
    Replanning,
    Done,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error)
    }
}

/// note 的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteSource {
    Generator,
    Validator,
    Executor,
    Evaluator,
    Reflector,
    Controller,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub source: NoteSource,
    pub message: String,
    /// 产生 note 时的计划代次
    pub generation: u32,
}

impl std::fmt::Display for Note {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = serde_json::to_value(self.source)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        write!(f, "[{source}] {}", self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub run_id: String,
    /// 毫秒时间戳
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checkpoint: Option<String>,
    /// 已保存的检查点数（快照序号）
    #[serde(default)]
    pub checkpoints: u64,
}

impl RunMetadata {
    pub fn new() -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            last_checkpoint: None,
            checkpoints: 0,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// 终止结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Terminal {
    Completed,
    /// 预算耗尽，带部分结果结束
    PartialBudget { counter: BudgetKind },
    ReplanLimitExceeded,
    Impossible { reason: String },
    Cancelled,
}

impl Terminal {
    pub fn status(&self) -> RunStatus {
        match self {
            Terminal::Completed | Terminal::PartialBudget { .. } => RunStatus::Done,
            _ => RunStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub goal: String,
    pub plan: Plan,
    pub artifacts: ArtifactStore,
    pub budget: Budget,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub status: RunStatus,
    /// 已执行的重规划次数
    #[serde(default)]
    pub replans: u32,
    #[serde(default)]
    pub local_repair_failures: u32,
    /// 当前计划来自哪种重规划（初始计划为 None）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_repair: Option<RepairMode>,
    /// Failure Reflector 对失败步骤的结论
    #[serde(default)]
    pub reflections: BTreeMap<StepId, Reflection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<Terminal>,
    pub metadata: RunMetadata,
}

impl RunState {
    pub fn new(goal: impl Into<String>, budget: Budget) -> Self {
        let goal = goal.into();
        Self {
            plan: Plan::new(goal.clone(), Vec::new()),
            goal,
            artifacts: ArtifactStore::new(),
            budget,
            notes: Vec::new(),
            status: RunStatus::Planning,
            replans: 0,
            local_repair_failures: 0,
            last_repair: None,
            reflections: BTreeMap::new(),
            terminal: None,
            metadata: RunMetadata::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.metadata.run_id
    }

    pub fn add_note(&mut self, source: NoteSource, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(source = ?source, %message, "note");
        self.notes.push(Note {
            source,
            message,
            generation: self.plan.generation,
        });
    }

    pub fn note_messages(&self) -> Vec<String> {
        self.notes.iter().map(Note::to_string).collect()
    }

    /// 进入新阶段
    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        self.metadata.touch();
    }

    pub fn report(&self) -> RunReport {
        let failed_steps = self
            .plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| FailedStep {
                step_id: s.id.clone(),
                tool: s.tool.clone(),
                error: s.last_error.clone().unwrap_or_default(),
                root_cause: self.reflections.get(&s.id).map(|r| r.root_cause.clone()),
            })
            .collect();
        RunReport {
            run_id: self.metadata.run_id.clone(),
            goal: self.goal.clone(),
            status: self.status,
            terminal: self.terminal.clone(),
            partial: matches!(self.terminal, Some(Terminal::PartialBudget { .. })),
            completed_steps: self.plan.completed_ids(),
            failed_steps,
            pending_steps: self.plan.ids_with_status(StepStatus::Pending),
            budget: BudgetUsage::from(&self.budget),
            replans: self.replans,
            generation: self.plan.generation,
            notes: self.note_messages(),
        }
    }
}

/// 报告中的失败步骤
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedStep {
    pub step_id: String,
    pub tool: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetUsage {
    pub tokens_used: u64,
    pub tokens_ceiling: Option<u64>,
    pub wall_secs_used: u64,
    pub wall_secs_ceiling: Option<u64>,
    pub steps_used: u64,
    pub steps_ceiling: Option<u64>,
}

impl From<&Budget> for BudgetUsage {
    fn from(budget: &Budget) -> Self {
        Self {
            tokens_used: budget.tokens.used,
            tokens_ceiling: budget.tokens.ceiling,
            wall_secs_used: budget.wall_secs.used,
            wall_secs_ceiling: budget.wall_secs.ceiling,
            steps_used: budget.steps.used,
            steps_ceiling: budget.steps.ceiling,
        }
    }
}

/// 用户可见的运行报告
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub goal: String,
    pub status: RunStatus,
    pub terminal: Option<Terminal>,
    pub partial: bool,
    pub completed_steps: Vec<StepId>,
    pub failed_steps: Vec<FailedStep>,
    pub pending_steps: Vec<StepId>,
    pub budget: BudgetUsage,
    pub replans: u32,
    pub generation: u32,
    pub notes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::Step;

    #[test]
    fn test_report_collects_failures_with_root_cause() {
        let mut state = RunState::new("g", Budget::with_steps(5));
        let mut a = Step::new("a", "echo");
        a.status = StepStatus::Completed;
        let mut b = Step::new("b", "read_file");
        b.status = StepStatus::Failed;
        b.last_error = Some("not found".into());
        state.plan = Plan::new("g", vec![a, b, Step::new("c", "echo")]);
        state
            .reflections
            .insert("b".into(), Reflection::fallback("missing file"));
        state.terminal = Some(Terminal::ReplanLimitExceeded);
        state.status = RunStatus::Error;

        let report = state.report();
        assert_eq!(report.completed_steps, vec!["a"]);
        assert_eq!(report.pending_steps, vec!["c"]);
        assert_eq!(report.failed_steps[0].error, "not found");
        assert_eq!(report.failed_steps[0].root_cause.as_deref(), Some("missing file"));
        assert!(!report.partial);
        assert_eq!(report.budget.steps_ceiling, Some(5));
    }

    #[test]
    fn test_notes_carry_source_and_generation() {
        let mut state = RunState::new("g", Budget::unlimited());
        state.plan.generation = 2;
        state.add_note(NoteSource::Validator, "bad tool");
        assert_eq!(state.notes[0].generation, 2);
        assert_eq!(state.note_messages(), vec!["[validator] bad tool"]);
    }

    #[test]
    fn test_state_serializes_round_trip() {
        let mut state = RunState::new("g", Budget::new(None, 10, 3));
        state.terminal = Some(Terminal::PartialBudget {
            counter: BudgetKind::Steps,
        });
        let json = serde_json::to_string(&state).unwrap();
        let back: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_terminal_status_mapping() {
        assert_eq!(Terminal::Completed.status(), RunStatus::Done);
        assert_eq!(
            Terminal::PartialBudget {
                counter: BudgetKind::Tokens
            }
            .status(),
            RunStatus::Done
        );
        assert_eq!(Terminal::Cancelled.status(), RunStatus::Error);
    }
}
