//! 工具执行器
//!
//! 持有 ToolRegistry 与默认超时，execute(tool_name, args) 在超时内调用 registry.execute，并与 Run 的
//! CancellationToken 竞争；返回值按工具契约归一为 ToolReply。每次调用输出结构化审计日志（JSON）。

use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::core::OrchestratorError;
use crate::tools::{ToolCatalog, ToolRegistry};

/// 工具自报的 token 消耗字段（从 payload 中剥离后计入预算）
pub const TOKENS_USED_FIELD: &str = "tokens_used";

/// 一次失败的工具调用
#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub error_type: String,
    pub message: String,
    pub retry_possible: bool,
    /// 失败前已消耗的 token（工具自报）
    pub tokens_used: u64,
}

/// 归一化后的工具返回
#[derive(Debug, Clone, PartialEq)]
pub enum ToolReply {
    Ok {
        fields: Map<String, Value>,
        tokens_used: u64,
    },
    Error(ToolFailure),
}

impl ToolReply {
    pub fn is_ok(&self) -> bool {
        matches!(self, ToolReply::Ok { .. })
    }

    /// 成功与失败都计入预算的 token 数
    pub fn tokens_used(&self) -> u64 {
        match self {
            ToolReply::Ok { tokens_used, .. } => *tokens_used,
            ToolReply::Error(failure) => failure.tokens_used,
        }
    }
}

/// 按工具契约归一 payload：`error: true` 一律视为失败，不看其它字段
pub fn classify_payload(payload: Value) -> ToolReply {
    let mut fields = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            return ToolReply::Ok {
                fields: map,
                tokens_used: 0,
            };
        }
    };

    let tokens_used = fields
        .remove(TOKENS_USED_FIELD)
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let flagged_error = fields.get("error").and_then(Value::as_bool) == Some(true);
    let reported_not_ok = fields.get("ok").and_then(Value::as_bool) == Some(false);
    if flagged_error || reported_not_ok {
        let error_type = fields
            .get("error_type")
            .and_then(Value::as_str)
            .unwrap_or("tool_reported")
            .to_string();
        let message = fields
            .get("error_message")
            .or_else(|| fields.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("tool reported failure without message")
            .to_string();
        let retry_possible = fields
            .get("retry_possible")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        return ToolReply::Error(ToolFailure {
            error_type,
            message,
            retry_possible,
            tokens_used,
        });
    }

    ToolReply::Ok {
        fields,
        tokens_used,
    }
}

/// 工具执行器：对每次调用施加超时与取消，并将结果映射为 ToolReply
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行指定工具；超时 / 未知工具 / 工具 Err 都转为 ToolReply::Error；仅取消返回 Err(Cancelled)
    pub async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        step_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<ToolReply, OrchestratorError> {
        if !self.registry.contains(tool_name) {
            return Ok(ToolReply::Error(ToolFailure {
                error_type: "unknown_tool".to_string(),
                message: format!("Unknown tool: {tool_name}"),
                retry_possible: false,
                tokens_used: 0,
            }));
        }

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let limit = step_timeout.unwrap_or(self.timeout);
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            r = timeout(limit, self.registry.execute(tool_name, args)) => Some(r),
        };

        let (ok, outcome): (bool, &str) = match &result {
            None => (false, "cancelled"),
            Some(Ok(Ok(_))) => (true, "ok"),
            Some(Ok(Err(_))) => (false, "error"),
            Some(Err(_)) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            None => Err(OrchestratorError::Cancelled),
            Some(Ok(Ok(payload))) => Ok(classify_payload(payload)),
            Some(Ok(Err(e))) => Ok(ToolReply::Error(ToolFailure {
                error_type: "execution_error".to_string(),
                message: e,
                retry_possible: true,
                tokens_used: 0,
            })),
            Some(Err(_)) => Ok(ToolReply::Error(ToolFailure {
                error_type: "timeout".to_string(),
                message: format!("Tool '{}' timed out after {}s", tool_name, limit.as_secs_f64()),
                retry_possible: true,
                tokens_used: 0,
            })),
        }
    }

    pub fn get_tool(&self, name: &str) -> Option<std::sync::Arc<dyn crate::tools::Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn catalog(&self) -> ToolCatalog {
        self.registry.catalog()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
