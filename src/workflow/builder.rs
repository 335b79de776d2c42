//! 计划构建器
//!
//! 提供流畅的 API 来构建计划（测试、CLI 与本地 patch 合并共用）；不做校验，校验交给 PlanValidator。

use serde_json::Value;

use crate::workflow::types::*;

/// 计划构建器
pub struct PlanBuilder {
    goal: String,
    steps: Vec<Step>,
}

impl PlanBuilder {
    /// 创建新的计划构建器
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            steps: Vec::new(),
        }
    }

    /// 添加步骤
    pub fn step(mut self, id: impl Into<StepId>, tool: impl Into<String>) -> Self {
        self.steps.push(Step::new(id, tool));
        self
    }

    /// 设置一个输入参数（字面量或 "$step.field" 引用）
    pub fn input(mut self, id: &str, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Some(step) = self.find(id) {
            step.inputs.insert(key.into(), value.into());
        }
        self
    }

    /// 设置顺序依赖：to 在 from 完成后执行
    pub fn sequential(mut self, from: impl Into<StepId>, to: &str) -> Self {
        let from = from.into();
        if let Some(step) = self.find(to) {
            if !step.deps.contains(&from) {
                step.deps.push(from);
            }
        }
        self
    }

    /// 设置 AND 依赖（所有前置步骤）
    pub fn depends_on<I, S>(mut self, id: &str, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<StepId>,
    {
        if let Some(step) = self.find(id) {
            for dep in deps {
                let dep = dep.into();
                if !step.deps.contains(&dep) {
                    step.deps.push(dep);
                }
            }
        }
        self
    }

    /// 追加成功条件
    pub fn criterion(mut self, id: &str, criterion: impl Into<String>) -> Self {
        if let Some(step) = self.find(id) {
            step.success_criteria.push(criterion.into());
        }
        self
    }

    pub fn max_retries(mut self, id: &str, max_retries: u32) -> Self {
        if let Some(step) = self.find(id) {
            step.max_retries = max_retries;
        }
        self
    }

    pub fn timeout_secs(mut self, id: &str, secs: u64) -> Self {
        if let Some(step) = self.find(id) {
            step.timeout_s = Some(secs);
        }
        self
    }

    pub fn evaluate(mut self, id: &str, evaluate: bool) -> Self {
        if let Some(step) = self.find(id) {
            step.evaluate = Some(evaluate);
        }
        self
    }

    /// 构建计划
    pub fn build(self) -> Plan {
        Plan::new(self.goal, self.steps)
    }

    fn find(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_simple_plan() {
        let plan = PlanBuilder::new("Test goal")
            .step("task1", "echo")
            .input("task1", "text", "hi")
            .step("task2", "echo")
            .input("task2", "text", "$task1.text")
            .sequential("task1", "task2")
            .criterion("task2", "text equals hi")
            .max_retries("task2", 0)
            .build();

        assert_eq!(plan.goal, "Test goal");
        assert_eq!(plan.steps.len(), 2);
        let task2 = plan.step("task2").unwrap();
        assert_eq!(task2.deps, vec!["task1"]);
        assert_eq!(task2.inputs["text"], json!("$task1.text"));
        assert_eq!(task2.max_retries, 0);
    }

    #[test]
    fn test_duplicate_deps_ignored() {
        let plan = PlanBuilder::new("g")
            .step("a", "echo")
            .step("b", "echo")
            .sequential("a", "b")
            .depends_on("b", ["a"])
            .build();
        assert_eq!(plan.step("b").unwrap().deps.len(), 1);
    }
}
