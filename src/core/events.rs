//! Run 过程事件：供 CLI 实时展示规划、校验、执行、评估、重规划与检查点

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::state::RunStatus;
use crate::planning::{EvaluationAction, RepairMode};
use crate::workflow::budget::BudgetKind;

/// 单个过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// 收到候选计划
    PlanGenerated {
        generation: u32,
        mode: RepairMode,
        steps: usize,
    },
    /// 计划未通过校验
    PlanRejected { generation: u32, issues: Vec<String> },
    PlanValidated { generation: u32, steps: usize },
    /// 开始一次步骤尝试
    StepStarted {
        step_id: String,
        tool: String,
        attempt: u32,
    },
    StepSucceeded { step_id: String },
    /// 一次尝试失败（will_retry=false 表示步骤最终失败或预算停下）
    StepFailed {
        step_id: String,
        error: String,
        will_retry: bool,
    },
    Evaluated {
        step_id: String,
        success: bool,
        action: EvaluationAction,
        confidence: f64,
    },
    Reflection { step_id: String, root_cause: String },
    Replanning { mode: RepairMode, replans: u32 },
    BudgetExhausted { counter: BudgetKind },
    Checkpoint { label: String, path: String },
    Finished { status: RunStatus },
}

pub type EventSender = mpsc::UnboundedSender<RunEvent>;

/// 发送事件；没有订阅者或接收端已关闭时静默丢弃
pub fn emit(events: Option<&EventSender>, event: RunEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
