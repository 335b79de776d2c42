//! Critic：步骤结果评估
//!
//! 工具成功返回后，对有 success_criteria 的步骤做一次轻量 LLM 调用，判断结果是否满足条件，
//! 给出 continue / retry / replan 建议与置信度。
//!
//! 通过配置可以：
//! - 启用/禁用评估
//! - 使用与 Plan Generator 不同的模型（避免自我认同）
//! - 仅评估特定工具（减少 token 开销）

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::EvaluationSection;
use crate::core::OrchestratorError;
use crate::llm::message::Message;
use crate::llm::LlmClient;
use crate::planning::parse::parse_json;
use crate::workflow::types::Step;

pub const DEFAULT_CRITIC_PROMPT: &str = r#"You are checking one step of an automated plan.
Goal: {goal}
Step: {step}
Tool: {tool}
Success criteria:
{criteria}
Tool result (JSON):
{result}

Reply with a single JSON object:
{"success": bool, "criteria_met": [..], "criteria_failed": [..], "action": "continue" | "retry" | "replan", "confidence": 0.0-1.0}"#;

/// Critic 建议的后续动作
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationAction {
    Retry,
    Replan,
    #[default]
    Continue,
}

/// 评估结论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub success: bool,
    #[serde(default)]
    pub criteria_met: Vec<String>,
    #[serde(default)]
    pub criteria_failed: Vec<String>,
    #[serde(default)]
    pub action: EvaluationAction,
    #[serde(default)]
    pub confidence: f64,
}

impl Evaluation {
    pub fn passed() -> Self {
        Self {
            success: true,
            criteria_met: Vec::new(),
            criteria_failed: Vec::new(),
            action: EvaluationAction::Continue,
            confidence: 1.0,
        }
    }

    /// 评估器不可用时的宽松结论：不阻塞执行
    pub fn lenient() -> Self {
        Self {
            confidence: 0.0,
            ..Self::passed()
        }
    }

    pub fn failed(action: EvaluationAction, confidence: f64, criteria_failed: Vec<String>) -> Self {
        Self {
            success: false,
            criteria_met: Vec::new(),
            criteria_failed,
            action,
            confidence,
        }
    }

    pub fn summary(&self) -> String {
        if self.success {
            "criteria met".to_string()
        } else if self.criteria_failed.is_empty() {
            format!("criteria not met (confidence {:.2})", self.confidence)
        } else {
            format!(
                "criteria not met: {} (confidence {:.2})",
                self.criteria_failed.join("; "),
                self.confidence
            )
        }
    }
}

/// 步骤评估器
#[async_trait]
pub trait StepEvaluator: Send + Sync {
    /// 该步骤是否需要评估
    fn should_evaluate(&self, step: &Step) -> bool {
        step.needs_evaluation()
    }

    async fn evaluate(
        &self,
        goal: &str,
        step: &Step,
        result: &Map<String, Value>,
    ) -> Result<Evaluation, OrchestratorError>;
}

/// LLM 评估器：持有 LLM、prompt 模板与工具过滤
pub struct Critic {
    llm: Arc<dyn LlmClient>,
    prompt_template: String,
    /// 是否评估所有工具
    evaluate_all_tools: bool,
    /// 仅评估的工具集合（evaluate_all_tools=false 时生效）
    evaluate_tools: HashSet<String>,
    timeout: Duration,
}

impl Critic {
    /// 从配置创建 Critic（需要外部传入 LLM 实例）
    pub fn from_config(llm: Arc<dyn LlmClient>, config: &EvaluationSection, timeout: Duration) -> Self {
        let prompt_template = if config.prompt_template.trim().is_empty() {
            DEFAULT_CRITIC_PROMPT.to_string()
        } else {
            config.prompt_template.clone()
        };
        Self {
            llm,
            prompt_template,
            evaluate_all_tools: config.evaluate_all_tools,
            evaluate_tools: config.evaluate_tools.iter().cloned().collect(),
            timeout,
        }
    }

    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            prompt_template: DEFAULT_CRITIC_PROMPT.to_string(),
            evaluate_all_tools: true,
            evaluate_tools: HashSet::new(),
            timeout: Duration::from_secs(60),
        }
    }

    /// 设置仅评估特定工具
    pub fn with_evaluate_tools(mut self, tools: Vec<String>) -> Self {
        self.evaluate_all_tools = false;
        self.evaluate_tools = tools.into_iter().collect();
        self
    }

    fn tool_selected(&self, tool: &str) -> bool {
        if self.evaluate_all_tools || self.evaluate_tools.is_empty() {
            return true;
        }
        self.evaluate_tools.contains(tool)
    }

    fn render(&self, goal: &str, step: &Step, result: &Map<String, Value>) -> String {
        let criteria = step
            .success_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n");
        let result = serde_json::to_string_pretty(result).unwrap_or_default();
        self.prompt_template
            .replace("{goal}", goal)
            .replace("{step}", &step.id)
            .replace("{tool}", &step.tool)
            .replace("{criteria}", &criteria)
            .replace("{result}", &result)
    }
}

#[async_trait]
impl StepEvaluator for Critic {
    fn should_evaluate(&self, step: &Step) -> bool {
        step.needs_evaluation() && self.tool_selected(&step.tool)
    }

    async fn evaluate(
        &self,
        goal: &str,
        step: &Step,
        result: &Map<String, Value>,
    ) -> Result<Evaluation, OrchestratorError> {
        let messages = vec![Message::user(self.render(goal, step, result))];
        let reply = tokio::time::timeout(self.timeout, self.llm.complete(&messages))
            .await
            .map_err(|_| OrchestratorError::OracleTimeout("critic".to_string()))?
            .map_err(OrchestratorError::LlmError)?;

        match parse_json::<Evaluation>(&reply) {
            Ok(mut evaluation) => {
                evaluation.confidence = evaluation.confidence.clamp(0.0, 1.0);
                Ok(evaluation)
            }
            Err(e) => {
                tracing::warn!(step = %step.id, error = %e, "critic reply unparsable, treating as pass");
                Ok(Evaluation::lenient())
            }
        }
    }
}
