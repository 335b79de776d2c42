//! 编排错误类型与错误分类
//!
//! OrchestratorError：基础设施故障（配置、I/O、序列化、Oracle 调用、Artifact 写保护）；
//! ErrorKind：计划与执行层面的错误分类，由 RecoveryEngine 映射为 RecoveryAction。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 编排过程中的基础设施错误（计划/执行层面的失败不走这里，而是转为 notes）
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Plan parse error: {0}")]
    PlanParseError(String),

    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    /// Plan Generator / Failure Reflector / Critic 超时
    #[error("Oracle timeout: {0}")]
    OracleTimeout(String),

    /// Artifact 每个 Step id 只能写一次（除非显式 invalidate 后重跑）
    #[error("Artifact for step '{0}' already written")]
    ArtifactAlreadyWritten(String),

    #[error("Unknown step: {0}")]
    UnknownStep(String),

    #[error("Checkpoint error: {0}")]
    CheckpointError(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,
}

/// 计划/执行错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Step 引用了注册表中不存在的工具
    HallucinatedTool,
    CycleDetected,
    /// deps 或 $step 引用不成立
    UnresolvedDependency,
    /// 执行时 Artifact 中找不到引用的字段
    UnresolvedReference,
    ToolError,
    /// 结果不满足 success_criteria
    CriteriaNotMet,
    BudgetExhausted,
    ReplanLimitExceeded,
    /// Plan Generator 判定目标无法用现有工具完成
    Impossible,
    Cancelled,
}

impl ErrorKind {
    /// 用户可见的终止性错误；其余错误都在内部自愈（转为 notes 进入下一次重规划）
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::BudgetExhausted
                | ErrorKind::ReplanLimitExceeded
                | ErrorKind::Impossible
                | ErrorKind::Cancelled
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::HallucinatedTool => "HallucinatedTool",
            ErrorKind::CycleDetected => "CycleDetected",
            ErrorKind::UnresolvedDependency => "UnresolvedDependency",
            ErrorKind::UnresolvedReference => "UnresolvedReference",
            ErrorKind::ToolError => "ToolError",
            ErrorKind::CriteriaNotMet => "CriteriaNotMet",
            ErrorKind::BudgetExhausted => "BudgetExhausted",
            ErrorKind::ReplanLimitExceeded => "ReplanLimitExceeded",
            ErrorKind::Impossible => "Impossible",
            ErrorKind::Cancelled => "Cancelled",
        };
        write!(f, "{s}")
    }
}

/// 恢复引擎根据错误类型给出的建议动作；终止性错误没有恢复动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 同一 Step 再跑一次（计入 max_retries）
    RetryStep,
    /// 只替换失败的 Step，保留已完成部分
    LocalRepair,
    /// 丢弃 DAG 结构，保留 Artifact Store，重新规划
    GlobalRepair,
}
