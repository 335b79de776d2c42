//! 计划类型定义
//!
//! Step / Plan 及其状态；同时是 Plan Generator 的 JSON 线格式（运行期字段在 schema 中隐藏）。

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::OrchestratorError;

pub type StepId = String;

/// 未显式给出 max_retries 时的默认值
pub const DEFAULT_MAX_RETRIES: u32 = 2;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Step 状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 等待依赖满足
    #[default]
    Pending,
    /// 依赖已满足，准备执行
    Ready,
    /// 正在执行
    Running,
    /// 已完成，Artifact 已写入
    Completed,
    /// 重试耗尽或不可重试的失败
    Failed,
    /// 跳过
    Skipped,
}

impl StepStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped
        )
    }
}

/// 计划中的一个步骤：一次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    /// 计划内唯一的步骤 ID
    pub id: StepId,
    /// 工具名，必须存在于工具目录中
    pub tool: String,
    /// 参数：字面量，或形如 "$<stepId>.<field>" 的引用（被引用的步骤必须出现在 deps 中）
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// 必须先完成的步骤 ID
    #[serde(default)]
    pub deps: Vec<StepId>,
    /// 可检查的成功条件
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 单次尝试的超时（秒），缺省用配置中的工具超时
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    /// 是否需要 Critic 评估；缺省时有 success_criteria 即评估
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluate: Option<bool>,

    #[serde(default)]
    #[schemars(skip)]
    pub status: StepStatus,
    /// 当前计划代次内已尝试次数
    #[serde(default)]
    #[schemars(skip)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(skip)]
    pub last_error: Option<String>,
}

impl Step {
    pub fn new(id: impl Into<StepId>, tool: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool: tool.into(),
            inputs: Map::new(),
            deps: Vec::new(),
            success_criteria: Vec::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            timeout_s: None,
            evaluate: None,
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn needs_evaluation(&self) -> bool {
        self.evaluate.unwrap_or(!self.success_criteria.is_empty())
    }

    /// 给 Critic / Reflector 的一句话描述
    pub fn describe(&self) -> String {
        let inputs = Value::Object(self.inputs.clone()).to_string();
        if self.success_criteria.is_empty() {
            format!("step '{}' calls tool '{}' with {}", self.id, self.tool, inputs)
        } else {
            format!(
                "step '{}' calls tool '{}' with {}; expected: {}",
                self.id,
                self.tool,
                inputs,
                self.success_criteria.join("; ")
            )
        }
    }

    /// 清空运行期字段，回到 pending（重规划后沿用的未完成步骤使用）
    pub fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
    }
}

/// 计划：Step 的有向无环图，保留声明顺序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<Step>,
    /// 计划代次：每次重规划 +1
    #[serde(default)]
    #[schemars(skip)]
    pub generation: u32,
}

impl Plan {
    pub fn new(goal: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            goal: goal.into(),
            steps,
            generation: 0,
        }
    }

    /// 从线格式 JSON 解析
    pub fn from_json(raw: &str) -> Result<Self, OrchestratorError> {
        serde_json::from_str(raw).map_err(|e| OrchestratorError::PlanParseError(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, OrchestratorError> {
        serde_json::from_value(value).map_err(|e| OrchestratorError::PlanParseError(e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.iter().any(|s| s.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<StepStatus> {
        self.step(id).map(|s| s.status)
    }

    pub fn ids(&self) -> Vec<StepId> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    pub fn ids_with_status(&self, status: StepStatus) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn completed_ids(&self) -> Vec<StepId> {
        self.ids_with_status(StepStatus::Completed)
    }

    pub fn is_complete(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.status == StepStatus::Completed)
    }

    /// 可执行的步骤：pending 且所有 deps 已 completed；按声明顺序
    pub fn ready_steps(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending || s.status == StepStatus::Ready)
            .filter(|s| {
                s.deps
                    .iter()
                    .all(|d| self.status_of(d) == Some(StepStatus::Completed))
            })
            .collect()
    }

    /// 检查点只能保存步骤之间的状态：running 一律回退为 pending
    pub fn settle_running(&mut self) {
        for step in &mut self.steps {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Pending;
            }
        }
    }
}
