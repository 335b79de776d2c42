//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序；DFS 三色标记做环检测并给出环路径。
//! 指向计划外步骤的依赖边被忽略（由校验器单独报告）。

use std::collections::HashMap;

use crate::workflow::types::{Plan, StepId, StepStatus};

/// 计划依赖图
pub struct PlanGraph {
    /// 声明顺序，保证输出稳定
    order: Vec<StepId>,
    /// 邻接表：步骤 ID -> 依赖该步骤的步骤列表
    pub adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 ID -> 计划内依赖数
    pub in_degree: HashMap<StepId, usize>,
    /// 正向依赖：步骤 ID -> 它依赖的步骤（仅计划内）
    deps: HashMap<StepId, Vec<StepId>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    White,
    Gray,
    Black,
}

impl PlanGraph {
    /// 创建依赖图
    pub fn new(plan: &Plan) -> Self {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();
        let mut deps: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut order = Vec::with_capacity(plan.steps.len());

        for step in &plan.steps {
            if in_degree.contains_key(&step.id) {
                continue;
            }
            order.push(step.id.clone());
            in_degree.insert(step.id.clone(), 0);
            adjacency.insert(step.id.clone(), Vec::new());
            deps.insert(step.id.clone(), Vec::new());
        }

        for step in &plan.steps {
            for dep_id in &step.deps {
                if !in_degree.contains_key(dep_id) {
                    continue;
                }
                let known = deps.entry(step.id.clone()).or_default();
                if known.contains(dep_id) {
                    continue;
                }
                known.push(dep_id.clone());
                adjacency.entry(dep_id.clone()).or_default().push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Self {
            order,
            adjacency,
            in_degree,
            deps,
        }
    }

    /// Kahn 拓扑排序；入度相同时按声明顺序。存在环时返回 None
    pub fn topological_order(&self) -> Option<Vec<StepId>> {
        let mut in_degree = self.in_degree.clone();
        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let mut ready: Vec<StepId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(*id) == Some(&0))
            .cloned()
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while !ready.is_empty() {
            ready.sort_by_key(|id| position.get(id.as_str()).copied().unwrap_or(usize::MAX));
            let current = ready.remove(0);
            if let Some(dependents) = self.adjacency.get(&current) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree -= 1;
                        if *degree == 0 {
                            ready.push(dependent.clone());
                        }
                    }
                }
            }
            sorted.push(current);
        }

        (sorted.len() == self.order.len()).then_some(sorted)
    }

    /// DFS 环检测；返回第一个发现的环（首尾为同一步骤），如 [a, b, a]
    pub fn find_cycle(&self) -> Option<Vec<StepId>> {
        let mut marks: HashMap<&str, Mark> =
            self.order.iter().map(|id| (id.as_str(), Mark::White)).collect();
        let mut stack: Vec<&str> = Vec::new();

        for start in &self.order {
            if marks.get(start.as_str()) == Some(&Mark::White) {
                if let Some(cycle) = self.visit(start, &mut marks, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<StepId>> {
        marks.insert(id, Mark::Gray);
        stack.push(id);

        if let Some(deps) = self.deps.get(id) {
            for dep in deps {
                match marks.get(dep.as_str()).copied().unwrap_or(Mark::Black) {
                    Mark::Gray => {
                        let start = stack.iter().position(|s| *s == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<StepId> =
                            stack[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Mark::White => {
                        if let Some(cycle) = self.visit(dep, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Black => {}
                }
            }
        }

        stack.pop();
        marks.insert(id, Mark::Black);
        None
    }

    /// 传递依赖于 roots 的所有步骤（不含 roots 本身），按声明顺序
    pub fn downstream_of(&self, roots: &[StepId]) -> Vec<StepId> {
        let mut seen: Vec<StepId> = Vec::new();
        let mut frontier: Vec<StepId> = roots.to_vec();
        while let Some(current) = frontier.pop() {
            if let Some(dependents) = self.adjacency.get(&current) {
                for dependent in dependents {
                    if !seen.contains(dependent) && !roots.contains(dependent) {
                        seen.push(dependent.clone());
                        frontier.push(dependent.clone());
                    }
                }
            }
        }
        self.order
            .iter()
            .filter(|id| seen.contains(id))
            .cloned()
            .collect()
    }
}

/// 因上游失败而永远无法就绪的步骤
pub fn blocked_steps(plan: &Plan) -> Vec<StepId> {
    let failed = plan.ids_with_status(StepStatus::Failed);
    if failed.is_empty() {
        return Vec::new();
    }
    PlanGraph::new(plan)
        .downstream_of(&failed)
        .into_iter()
        .filter(|id| plan.status_of(id) == Some(StepStatus::Pending))
        .collect()
}
