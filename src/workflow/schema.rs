//! 计划线格式的 JSON Schema（schemars 自动生成）
//!
//! 拼入 Plan Generator 的 system prompt，减少 LLM 输出格式错误。

use schemars::schema_for;

use crate::workflow::types::Plan;

/// 返回计划 JSON Schema 字符串
pub fn plan_schema_json() -> String {
    let schema = schema_for!(Plan);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_hides_runtime_fields() {
        let schema = plan_schema_json();
        assert!(schema.contains("\"steps\""));
        assert!(schema.contains("\"success_criteria\""));
        assert!(!schema.contains("\"attempts\""));
        assert!(!schema.contains("\"generation\""));
    }
}
