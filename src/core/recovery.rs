//! 错误恢复引擎
//!
//! 根据 ErrorKind 返回 RecoveryAction，并决定步骤失败后走局部修复还是全局重规划。

use crate::core::{ErrorKind, RecoveryAction};

/// 语义化错误恢复：将错误分类映射为可执行动作
#[derive(Debug, Clone, Copy)]
pub struct RecoveryEngine {
    max_replans: u32,
    /// 失败步骤数不超过该值时才考虑局部修复
    local_repair_max_failed_steps: usize,
    /// 局部修复失败达到该次数后改走全局重规划
    local_repairs_before_global: u32,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(3, 2, 2)
    }
}

impl RecoveryEngine {
    pub fn new(max_replans: u32, local_repair_max_failed_steps: usize, local_repairs_before_global: u32) -> Self {
        Self {
            max_replans,
            local_repair_max_failed_steps,
            local_repairs_before_global,
        }
    }

    /// 单个错误分类的建议动作；终止性错误返回 None，由 Orchestrator 直接结束运行
    pub fn handle(&self, kind: ErrorKind) -> Option<RecoveryAction> {
        if kind.is_terminal() {
            return None;
        }
        Some(match kind {
            ErrorKind::ToolError | ErrorKind::UnresolvedReference => RecoveryAction::RetryStep,
            _ => RecoveryAction::GlobalRepair,
        })
    }

    /// 步骤最终失败后的修复方式：失败少且局部修复失败次数未到上限时局部修复，否则全局
    pub fn repair_for_failures(&self, kinds: &[ErrorKind], local_repair_failures: u32) -> RecoveryAction {
        if kinds
            .iter()
            .any(|k| self.handle(*k) == Some(RecoveryAction::GlobalRepair))
        {
            return RecoveryAction::GlobalRepair;
        }
        if self.local_repair_allowed(kinds.len(), local_repair_failures) {
            RecoveryAction::LocalRepair
        } else {
            RecoveryAction::GlobalRepair
        }
    }

    pub fn local_repair_allowed(&self, failed_steps: usize, local_repair_failures: u32) -> bool {
        failed_steps > 0
            && failed_steps <= self.local_repair_max_failed_steps
            && local_repair_failures < self.local_repairs_before_global
    }

    /// 是否还能再重规划一次
    pub fn can_replan(&self, replans: u32) -> bool {
        replans < self.max_replans
    }
}
