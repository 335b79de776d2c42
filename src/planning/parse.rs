//! LLM 回复解析：提取 JSON 块（```json ... ``` 围栏或裸 JSON 对象）

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::core::OrchestratorError;

/// 从 LLM 回复中截出第一个 JSON 对象的文本；没有 `{` 时返回 None
pub fn extract_json_block(output: &str) -> Option<&str> {
    let trimmed = output.trim();

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some(body.trim());
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        if let Some(end) = rest.find("```") {
            let body = rest[..end].trim();
            if body.starts_with('{') {
                return Some(body);
            }
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 提取并解析为 JSON 值
pub fn parse_json_value(output: &str) -> Result<Value, OrchestratorError> {
    let block = extract_json_block(output).ok_or_else(|| {
        OrchestratorError::JsonParseError(format!("no JSON object in reply: {}", preview(output)))
    })?;
    serde_json::from_str(block)
        .map_err(|e| OrchestratorError::JsonParseError(format!("{}: {}", e, preview(block))))
}

/// 提取并反序列化为指定类型
pub fn parse_json<T: DeserializeOwned>(output: &str) -> Result<T, OrchestratorError> {
    let value = parse_json_value(output)?;
    serde_json::from_value(value).map_err(|e| OrchestratorError::JsonParseError(e.to_string()))
}

fn preview(s: &str) -> String {
    const MAX: usize = 200;
    if s.chars().count() > MAX {
        format!("{}...", s.chars().take(MAX).collect::<String>())
    } else {
        s.to_string()
    }
}
