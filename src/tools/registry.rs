//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），由 ToolRegistry 按名注册与查找。
//! 校验器只依赖注册表导出的 ToolCatalog（名称集合 + 描述），从不接触工具内部。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
///
/// execute 的返回约定：
/// - `Ok({"ok": true, ...fields})`：成功，fields 写入 Artifact Store
/// - `Ok({"error": true, "error_type", "error_message", "retry_possible"})`：工具自报失败
/// - `Err(msg)`：执行异常，视为可重试失败
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（对应 Step.tool）
    fn name(&self) -> &str;

    /// 工具描述（供 Plan Generator 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 工具目录中的一项：只有名称、描述与参数 schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 工具目录：名称有序，供校验器与 Plan Generator 使用
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 仅由名称构造（描述为空），测试与 CLI validate 常用
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut catalog = Self::new();
        for name in names {
            let name = name.into();
            catalog.insert(ToolSpec {
                name,
                description: String::new(),
                parameters: serde_json::json!({ "type": "object" }),
            });
        }
        catalog
    }

    pub fn insert(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 生成 prompt 中的 Available tools 段落
    pub fn describe(&self) -> String {
        self.tools
            .values()
            .map(|spec| {
                if spec.description.is_empty() {
                    format!("- {}", spec.name)
                } else {
                    format!("- {}: {}", spec.name, spec.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// 工具注册表：按名称存储 Arc<dyn Tool>，支持 register / get / execute / catalog
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<Value, String> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 导出工具目录（名称 + 描述 + 参数 schema）
    pub fn catalog(&self) -> ToolCatalog {
        let mut catalog = ToolCatalog::new();
        for (name, tool) in &self.tools {
            catalog.insert(ToolSpec {
                name: name.clone(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            });
        }
        catalog
    }
}
