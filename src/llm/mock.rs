//! Mock / Scripted LLM 客户端（用于测试与离线运行，无需 API）
//!
//! - MockLlmClient：从最后一条 User 消息中取出 `Goal:` 行，回显为单步 echo 计划，便于本地跑通编排流程。
//! - ScriptedLlmClient：按顺序返回预置回复，用于对 Plan Generator / Critic / Reflector 做确定性测试。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role};

/// Mock 客户端：把目标回显为一个 echo 步骤
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let goal = last_user
            .lines()
            .find_map(|line| line.trim().strip_prefix("Goal:"))
            .map(str::trim)
            .unwrap_or(last_user);

        let plan = serde_json::json!({
            "goal": goal,
            "steps": [{
                "id": "echo_goal",
                "tool": "echo",
                "inputs": { "text": format!("Echo from Mock: {goal}") },
                "deps": [],
                "success_criteria": [],
                "max_retries": 0,
            }]
        });
        Ok(plan.to_string())
    }
}

/// 脚本化客户端：每次 complete 弹出一条预置回复；用完后返回 Err
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    replies: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    tokens_per_reply: u64,
    tokens_total: AtomicU64,
}

impl ScriptedLlmClient {
    pub fn new<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            tokens_per_reply: 0,
            tokens_total: AtomicU64::new(0),
        }
    }

    /// 每条成功回复计入的 token 数（经 token_usage 报告）
    pub fn with_tokens_per_reply(mut self, tokens: u64) -> Self {
        self.tokens_per_reply = tokens;
        self
    }

    /// 追加一条回复
    pub fn push_reply(&self, reply: impl Into<String>) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.push_back(reply.into());
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用时最后一条消息的内容（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let (Ok(mut prompts), Some(last)) = (self.prompts.lock(), messages.last()) {
            prompts.push(last.content.clone());
        }
        let reply = self
            .replies
            .lock()
            .map_err(|e| e.to_string())?
            .pop_front()
            .ok_or_else(|| "scripted replies exhausted".to_string())?;
        self.tokens_total
            .fetch_add(self.tokens_per_reply, Ordering::SeqCst);
        Ok(reply)
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        let total = self.tokens_total.load(Ordering::SeqCst);
        (0, total, total)
    }
}
