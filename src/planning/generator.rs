//! Plan Generator：把目标（以及重规划上下文）交给 LLM，得到候选计划或「无法完成」的判定
//!
//! 唯一的非确定性规划依赖，藏在窄接口 PlanGenerator 之后；测试用 ScriptedLlmClient 喂固定 JSON。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::OrchestratorError;
use crate::llm::message::Message;
use crate::llm::LlmClient;
use crate::planning::parse::parse_json_value;
use crate::tools::ToolCatalog;
use crate::workflow::schema::plan_schema_json;
use crate::workflow::types::{Plan, StepId, DEFAULT_MAX_RETRIES};

/// 规划模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairMode {
    #[default]
    Initial,
    /// 只替换失败步骤，已完成步骤冻结
    Local,
    /// 重新设计整个 DAG，保留 Artifact Store
    Global,
}

impl std::fmt::Display for RepairMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RepairMode::Initial => write!(f, "initial"),
            RepairMode::Local => write!(f, "local"),
            RepairMode::Global => write!(f, "global"),
        }
    }
}

/// 一次规划请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanRequest {
    pub goal: String,
    pub tool_catalog: ToolCatalog,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_plan: Option<Plan>,
    #[serde(default)]
    pub notes: Vec<String>,
    pub mode: RepairMode,
    #[serde(default)]
    pub failing_steps: Vec<StepId>,
    #[serde(default)]
    pub frozen_steps: Vec<StepId>,
    /// 已有产出的步骤及其字段名（全局重规划时可作为普通依赖引用）
    #[serde(default)]
    pub available_artifacts: BTreeMap<StepId, Vec<String>>,
}

impl PlanRequest {
    pub fn initial(goal: impl Into<String>, tool_catalog: ToolCatalog) -> Self {
        Self {
            goal: goal.into(),
            tool_catalog,
            ..Self::default()
        }
    }
}

/// Plan Generator 的回答
#[derive(Debug, Clone, PartialEq)]
pub enum PlanCandidate {
    Plan(Plan),
    Impossible { reason: String },
}

impl PlanCandidate {
    /// 解析 LLM 回复：`{"complexity": "impossible", "reason"}` 或计划 JSON（goal 可省略）
    pub fn from_reply(reply: &str, goal: &str) -> Result<Self, OrchestratorError> {
        Self::from_reply_with_defaults(reply, goal, DEFAULT_MAX_RETRIES)
    }

    /// 同 from_reply，未给出 max_retries 的步骤使用 default_max_retries
    pub fn from_reply_with_defaults(
        reply: &str,
        goal: &str,
        default_max_retries: u32,
    ) -> Result<Self, OrchestratorError> {
        let mut value = parse_json_value(reply)?;
        if value.get("complexity").and_then(Value::as_str) == Some("impossible") {
            let reason = value
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("goal cannot be achieved with the available tools")
                .to_string();
            return Ok(PlanCandidate::Impossible { reason });
        }
        if let Value::Object(map) = &mut value {
            map.entry("goal")
                .or_insert_with(|| Value::String(goal.to_string()));
            if let Some(Value::Array(steps)) = map.get_mut("steps") {
                for step in steps.iter_mut().filter_map(Value::as_object_mut) {
                    step.entry("max_retries")
                        .or_insert_with(|| Value::from(default_max_retries));
                }
            }
        }
        Plan::from_value(value).map(PlanCandidate::Plan)
    }
}

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, request: &PlanRequest) -> Result<PlanCandidate, OrchestratorError>;
}

const GENERATOR_SYSTEM_PROMPT: &str = r#"You turn a user goal into a plan: a JSON object {"goal", "steps"} where each step calls exactly one tool from the catalog.
Rules:
- Use only tool names listed in the catalog. Never invent tools.
- Pass data between steps with "$<stepId>.<field>" references and list every referenced step in "deps".
- The steps must form a DAG.
- If the goal cannot be achieved with these tools, reply {"complexity": "impossible", "reason": "..."}.
Reply with JSON only.

Plan JSON Schema:
"#;

/// LLM 适配器
pub struct LlmPlanGenerator {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    default_max_retries: u32,
}

impl LlmPlanGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: format!("{GENERATOR_SYSTEM_PROMPT}{}", plan_schema_json()),
            default_max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    /// 用户消息：首行固定为 `Goal: ...`
    fn render_request(request: &PlanRequest) -> String {
        let mut out = format!("Goal: {}\nMode: {}\n\nTools:\n{}", request.goal, request.mode, request.tool_catalog.describe());

        if let Some(prior) = &request.prior_plan {
            let prior = serde_json::to_string_pretty(prior).unwrap_or_default();
            out.push_str(&format!("\nPrevious plan:\n{prior}\n"));
        }
        if !request.notes.is_empty() {
            out.push_str("\nNotes from previous attempts:\n");
            for note in &request.notes {
                out.push_str(&format!("- {note}\n"));
            }
        }
        match request.mode {
            RepairMode::Local => {
                out.push_str(&format!(
                    "\nReplace ONLY these failing steps: {}\nKeep each failing step's id on its replacement so later steps still resolve.\nDo not change these completed steps: {}\nReturn {{\"steps\": [...]}} with the replacement steps.\n",
                    request.failing_steps.join(", "),
                    request.frozen_steps.join(", ")
                ));
            }
            RepairMode::Global if !request.available_artifacts.is_empty() => {
                out.push_str("\nCompleted steps whose outputs you may reference as ordinary deps:\n");
                for (id, fields) in &request.available_artifacts {
                    out.push_str(&format!("- {id}: {}\n", fields.join(", ")));
                }
            }
            _ => {}
        }
        out
    }
}

#[async_trait]
impl PlanGenerator for LlmPlanGenerator {
    async fn generate(&self, request: &PlanRequest) -> Result<PlanCandidate, OrchestratorError> {
        let messages = vec![
            Message::system(self.system_prompt.clone()),
            Message::user(Self::render_request(request)),
        ];
        let reply = self
            .llm
            .complete(&messages)
            .await
            .map_err(OrchestratorError::LlmError)?;
        tracing::debug!(mode = %request.mode, reply_len = reply.len(), "plan generator replied");
        PlanCandidate::from_reply_with_defaults(&reply, &request.goal, self.default_max_retries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{MockLlmClient, ScriptedLlmClient};

    #[tokio::test]
    async fn test_mock_round_trip() {
        let gen = LlmPlanGenerator::new(Arc::new(MockLlmClient));
        let request = PlanRequest::initial("say hello", ToolCatalog::from_names(["echo"]));
        let PlanCandidate::Plan(plan) = gen.generate(&request).await.unwrap() else {
            panic!("expected a plan");
        };
        assert_eq!(plan.goal, "say hello");
        assert_eq!(plan.steps[0].tool, "echo");
    }

    #[tokio::test]
    async fn test_impossible_verdict() {
        let llm = ScriptedLlmClient::new([r#"{"complexity": "impossible", "reason": "no calendar tool"}"#]);
        let gen = LlmPlanGenerator::new(Arc::new(llm));
        let candidate = gen
            .generate(&PlanRequest::initial("book a flight", ToolCatalog::new()))
            .await
            .unwrap();
        assert_eq!(
            candidate,
            PlanCandidate::Impossible {
                reason: "no calendar tool".into()
            }
        );
    }

    #[tokio::test]
    async fn test_local_request_lists_failing_and_frozen() {
        let llm = Arc::new(ScriptedLlmClient::new([r#"{"steps": []}"#]));
        let gen = LlmPlanGenerator::new(llm.clone());
        let request = PlanRequest {
            mode: RepairMode::Local,
            failing_steps: vec!["b".into()],
            frozen_steps: vec!["a".into()],
            notes: vec!["[reflection] b: disk full".into()],
            ..PlanRequest::initial("g", ToolCatalog::from_names(["echo"]))
        };
        let candidate = gen.generate(&request).await.unwrap();
        assert!(matches!(candidate, PlanCandidate::Plan(p) if p.goal == "g" && p.is_empty()));
        let prompt = &llm.prompts()[0];
        assert!(prompt.starts_with("Goal: g"));
        assert!(prompt.contains("Replace ONLY these failing steps: b"));
        assert!(prompt.contains("Keep each failing step's id"));
        assert!(prompt.contains("- [reflection] b: disk full"));
    }

    #[test]
    fn test_system_prompt_embeds_schema() {
        let gen = LlmPlanGenerator::new(Arc::new(MockLlmClient));
        assert!(gen.system_prompt().contains("success_criteria"));
    }

    #[test]
    fn test_default_max_retries_fills_missing_only() {
        let reply = r#"{"steps": [{"id": "a", "tool": "echo"}, {"id": "b", "tool": "echo", "max_retries": 4}]}"#;
        let PlanCandidate::Plan(plan) = PlanCandidate::from_reply_with_defaults(reply, "g", 0).unwrap() else {
            panic!("expected a plan");
        };
        assert_eq!(plan.steps[0].max_retries, 0);
        assert_eq!(plan.steps[1].max_retries, 4);
    }

    #[test]
    fn test_garbage_reply_is_parse_error() {
        let err = PlanCandidate::from_reply("I cannot help", "g").unwrap_err();
        assert!(matches!(err, OrchestratorError::JsonParseError(_)));
    }
}
