//! 运行预算：tokens / 墙钟时间 / 步数 三个独立计数器
//!
//! 每个计数器有上限（ceiling）与单调不减的 used；开始新工作前检查 can_start，
//! 扣减时在上限处饱和（used 永不超过 ceiling），耗尽后由调度器在步骤之间停下，绝不打断进行中的步骤。

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 计数器种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetKind {
    Tokens,
    WallTime,
    Steps,
}

impl std::fmt::Display for BudgetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BudgetKind::Tokens => write!(f, "tokens"),
            BudgetKind::WallTime => write!(f, "wall_time"),
            BudgetKind::Steps => write!(f, "steps"),
        }
    }
}

/// 单个计数器；ceiling 为 None 表示不限
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub ceiling: Option<u64>,
    pub used: u64,
}

impl Counter {
    pub fn limited(ceiling: u64) -> Self {
        Self {
            ceiling: Some(ceiling),
            used: 0,
        }
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn remaining(&self) -> Option<u64> {
        self.ceiling.map(|c| c.saturating_sub(self.used))
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// 扣减并在上限处饱和；返回本次扣减是否超出上限
    pub fn charge(&mut self, amount: u64) -> bool {
        let wanted = self.used.saturating_add(amount);
        match self.ceiling {
            Some(ceiling) if wanted > ceiling => {
                self.used = ceiling;
                true
            }
            _ => {
                self.used = wanted;
                false
            }
        }
    }
}

/// 一次扣减的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetCharge {
    /// 本次扣减超出上限的计数器
    pub overflowed: Vec<BudgetKind>,
}

/// 三计数器预算。墙钟时间以整秒计，每次尝试向上取整
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub tokens: Counter,
    pub wall_secs: Counter,
    pub steps: Counter,
}

impl Default for Budget {
    fn default() -> Self {
        Self::unlimited()
    }
}

impl Budget {
    /// max_tokens 为 None 表示 token 不限
    pub fn new(max_tokens: Option<u64>, max_wall_secs: u64, max_steps: u64) -> Self {
        Self {
            tokens: max_tokens.map(Counter::limited).unwrap_or_default(),
            wall_secs: Counter::limited(max_wall_secs),
            steps: Counter::limited(max_steps),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            tokens: Counter::unlimited(),
            wall_secs: Counter::unlimited(),
            steps: Counter::unlimited(),
        }
    }

    pub fn with_steps(max_steps: u64) -> Self {
        Self {
            steps: Counter::limited(max_steps),
            ..Self::unlimited()
        }
    }

    /// 第一个已耗尽的计数器（按 steps / wall_time / tokens 顺序）
    pub fn exhausted(&self) -> Option<BudgetKind> {
        if self.steps.is_exhausted() {
            Some(BudgetKind::Steps)
        } else if self.wall_secs.is_exhausted() {
            Some(BudgetKind::WallTime)
        } else if self.tokens.is_exhausted() {
            Some(BudgetKind::Tokens)
        } else {
            None
        }
    }

    /// 开始任何消耗预算的工作前调用
    pub fn can_start(&self) -> Result<(), BudgetKind> {
        match self.exhausted() {
            Some(kind) => Err(kind),
            None => Ok(()),
        }
    }

    pub fn remaining_steps(&self) -> Option<u64> {
        self.steps.remaining()
    }

    /// 一次步骤尝试后的扣减：1 个步数单位、耗时、工具上报的 token
    pub fn charge_attempt(&mut self, elapsed: Duration, tokens: u64) -> BudgetCharge {
        let mut overflowed = Vec::new();
        if self.steps.charge(1) {
            overflowed.push(BudgetKind::Steps);
        }
        if self.wall_secs.charge(ceil_secs(elapsed)) {
            overflowed.push(BudgetKind::WallTime);
        }
        if self.tokens.charge(tokens) {
            overflowed.push(BudgetKind::Tokens);
        }
        BudgetCharge { overflowed }
    }

    /// 不属于任何步骤尝试的 token 消耗（Plan Generator / Critic / Reflector）
    pub fn charge_tokens(&mut self, tokens: u64) -> BudgetCharge {
        let mut overflowed = Vec::new();
        if self.tokens.charge(tokens) {
            overflowed.push(BudgetKind::Tokens);
        }
        BudgetCharge { overflowed }
    }

    /// 恢复运行时按新配置放宽上限：取两者较大者，任一方不限则不限；used 保持不变
    pub fn raise_ceilings(&mut self, template: &Budget) {
        for (counter, other) in [
            (&mut self.tokens, template.tokens),
            (&mut self.wall_secs, template.wall_secs),
            (&mut self.steps, template.steps),
        ] {
            counter.ceiling = match (counter.ceiling, other.ceiling) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
        }
    }

}

/// 不足一秒按一秒计；零耗时不计
fn ceil_secs(elapsed: Duration) -> u64 {
    let whole = elapsed.as_secs();
    if elapsed.subsec_nanos() > 0 {
        whole.saturating_add(1)
    } else {
        whole
    }
}
