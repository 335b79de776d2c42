//! Failure Reflector：解释步骤为何失败，给出纠正建议
//!
//! 每个失败步骤调用一次；输出进入 notes，随局部/全局重规划请求交给 Plan Generator。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::OrchestratorError;
use crate::llm::message::Message;
use crate::llm::LlmClient;
use crate::planning::parse::parse_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReflectionRequest {
    pub step_description: String,
    pub error_message: String,
    /// 目标、已完成步骤等上下文
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub root_cause: String,
    #[serde(default)]
    pub corrective_actions: Vec<String>,
    #[serde(default)]
    pub retry_recommended: bool,
}

impl Reflection {
    /// 回复无法解析时的退化结论：根因就是原始错误
    pub fn fallback(error_message: &str) -> Self {
        Self {
            root_cause: error_message.to_string(),
            corrective_actions: Vec::new(),
            retry_recommended: false,
        }
    }

    pub fn to_note(&self, step_id: &str) -> String {
        if self.corrective_actions.is_empty() {
            format!("step '{}' failed: {}", step_id, self.root_cause)
        } else {
            format!(
                "step '{}' failed: {}; suggested: {}",
                step_id,
                self.root_cause,
                self.corrective_actions.join("; ")
            )
        }
    }
}

#[async_trait]
pub trait FailureReflector: Send + Sync {
    async fn reflect(&self, request: &ReflectionRequest) -> Result<Reflection, OrchestratorError>;
}

const REFLECTOR_PROMPT: &str = r#"A step of an automated plan failed after all retries.
Step: {step}
Error: {error}
Context:
{context}

Explain the root cause and how the plan should change. Reply with JSON only:
{"root_cause": "...", "corrective_actions": ["..."], "retry_recommended": bool}"#;

pub struct LlmFailureReflector {
    llm: Arc<dyn LlmClient>,
}

impl LlmFailureReflector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl FailureReflector for LlmFailureReflector {
    async fn reflect(&self, request: &ReflectionRequest) -> Result<Reflection, OrchestratorError> {
        let prompt = REFLECTOR_PROMPT
            .replace("{step}", &request.step_description)
            .replace("{error}", &request.error_message)
            .replace("{context}", &request.context);
        let reply = self
            .llm
            .complete(&[Message::user(prompt)])
            .await
            .map_err(OrchestratorError::LlmError)?;
        match parse_json::<Reflection>(&reply) {
            Ok(reflection) => Ok(reflection),
            Err(e) => {
                tracing::warn!(error = %e, "reflector reply unparsable, using raw error");
                Ok(Reflection::fallback(&request.error_message))
            }
        }
    }
}
