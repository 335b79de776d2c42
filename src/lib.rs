//! TaskPilot - Rust 任务编排核心
//!
//! 把自然语言目标交给 LLM 生成工具调用 DAG，校验后逐步执行，评估结果，失败时反思并局部或全局重规划，
//! 全程受预算约束并在阶段边界写检查点。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类与恢复、运行状态、过程事件、Orchestrator 主控循环与构建器
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **observability**: tracing 订阅器
//! - **persistence**: Run State 检查点
//! - **planning**: Plan Generator、Critic、Failure Reflector
//! - **tools**: 工具注册表、执行器与内置工具（echo、list_dir、read_file）
//! - **workflow**: 计划模型、依赖图、引用解析、Artifact Store、预算、校验与调度

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod persistence;
pub mod planning;
pub mod tools;
pub mod workflow;

pub use crate::core::{Orchestrator, OrchestratorBuilder, OrchestratorError, RunReport, RunState};
pub use crate::workflow::{Plan, PlanBuilder, Step};
