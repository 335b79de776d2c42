//! 计划校验器
//!
//! 纯函数、确定性：在任何工具执行之前拒绝幻觉工具、环、坏依赖、坏引用、空计划与超预算计划。
//! 校验结果不走 Err，而是 ValidationReport；issues 会渲染成 notes 交回 Plan Generator。

use serde::{Deserialize, Serialize};

use crate::tools::ToolCatalog;
use crate::workflow::budget::Budget;
use crate::workflow::graph::PlanGraph;
use crate::workflow::reference::refs_in_inputs;
use crate::workflow::types::{Plan, StepStatus};

/// 默认的 max_retries 上限（超过只给 warning）
pub const DEFAULT_MAX_RETRIES_CAP: u32 = 5;

struct ToolAlias {
    tokens: &'static [&'static str],
    tool: &'static str,
}

/// 常见的臆造工具名 → 实际存在的多用途工具。按 token 子集匹配（见 name_tokens）
const TOOL_ALIASES: &[ToolAlias] = &[
    ToolAlias { tokens: &["list", "file"], tool: "organize_files" },
    ToolAlias { tokens: &["move", "file"], tool: "organize_files" },
    ToolAlias { tokens: &["copy", "file"], tool: "organize_files" },
    ToolAlias { tokens: &["rename", "file"], tool: "organize_files" },
    ToolAlias { tokens: &["delete", "file"], tool: "organize_files" },
    ToolAlias { tokens: &["create", "folder"], tool: "organize_files" },
    ToolAlias { tokens: &["make", "folder"], tool: "organize_files" },
    ToolAlias { tokens: &["mkdir"], tool: "organize_files" },
    ToolAlias { tokens: &["screenshot"], tool: "capture_screenshot" },
    ToolAlias { tokens: &["screen", "capture"], tool: "capture_screenshot" },
    ToolAlias { tokens: &["send", "mail"], tool: "compose_email" },
    ToolAlias { tokens: &["email"], tool: "compose_email" },
    ToolAlias { tokens: &["stock"], tool: "get_stock_price" },
    ToolAlias { tokens: &["slack"], tool: "send_slack_message" },
    ToolAlias { tokens: &["git"], tool: "git_operations" },
    ToolAlias { tokens: &["ls"], tool: "list_dir" },
    ToolAlias { tokens: &["dir"], tool: "list_dir" },
    ToolAlias { tokens: &["cat"], tool: "read_file" },
    ToolAlias { tokens: &["read"], tool: "read_file" },
    ToolAlias { tokens: &["open", "file"], tool: "read_file" },
    ToolAlias { tokens: &["print"], tool: "echo" },
    ToolAlias { tokens: &["say"], tool: "echo" },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    HallucinatedTool,
    DuplicateStepId,
    UnknownDependency,
    CycleDetected,
    UnresolvedDependency,
    EmptyPlan,
    BudgetInfeasible,
    RetryBoundExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// 一条校验问题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub kind: IssueKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_tools: Vec<String>,
}

impl Issue {
    fn error(kind: IssueKind, step_id: Option<&str>, message: String) -> Self {
        Self {
            kind,
            severity: Severity::Error,
            step_id: step_id.map(str::to_string),
            message,
            suggested_tools: Vec::new(),
        }
    }

    /// 渲染为给 Plan Generator 的一行 note
    pub fn to_note(&self) -> String {
        let mut note = format!("[{:?}] {}", self.kind, self.message);
        if !self.suggested_tools.is_empty() {
            note.push_str(&format!(
                "; use one of: {}",
                self.suggested_tools.join(", ")
            ));
        }
        note
    }
}

/// 校验报告：任何 error 级 issue 即 ok=false
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    fn from_issues(issues: Vec<Issue>) -> Self {
        let ok = !issues.iter().any(|i| i.severity == Severity::Error);
        Self { ok, issues }
    }

    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn has(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    pub fn to_notes(&self) -> Vec<String> {
        self.issues.iter().map(Issue::to_note).collect()
    }
}

/// 计划校验器
#[derive(Debug, Clone, Copy)]
pub struct PlanValidator {
    max_retries_cap: u32,
}

impl Default for PlanValidator {
    fn default() -> Self {
        Self {
            max_retries_cap: DEFAULT_MAX_RETRIES_CAP,
        }
    }
}

impl PlanValidator {
    pub fn new(max_retries_cap: u32) -> Self {
        Self { max_retries_cap }
    }

    pub fn validate(&self, plan: &Plan, catalog: &ToolCatalog, budget: &Budget) -> ValidationReport {
        if plan.is_empty() {
            return ValidationReport::from_issues(vec![Issue::error(
                IssueKind::EmptyPlan,
                None,
                "plan has no steps".to_string(),
            )]);
        }

        let mut issues = Vec::new();
        check_duplicates(plan, &mut issues);
        for step in &plan.steps {
            if !catalog.contains(&step.tool) {
                issues.push(Issue {
                    suggested_tools: suggest_tools(&step.tool, catalog),
                    ..Issue::error(
                        IssueKind::HallucinatedTool,
                        Some(&step.id),
                        format!(
                            "step '{}' uses tool '{}' which is not in the tool catalog",
                            step.id, step.tool
                        ),
                    )
                });
            }

            for dep in &step.deps {
                if dep == &step.id {
                    issues.push(Issue::error(
                        IssueKind::CycleDetected,
                        Some(&step.id),
                        format!("step '{}' depends on itself", step.id),
                    ));
                } else if !plan.contains(dep) {
                    issues.push(Issue::error(
                        IssueKind::UnknownDependency,
                        Some(&step.id),
                        format!("step '{}' depends on unknown step '{}'", step.id, dep),
                    ));
                }
            }

            let mut reported: Vec<String> = Vec::new();
            for reference in refs_in_inputs(&step.inputs) {
                if reported.contains(&reference.step_id) {
                    continue;
                }
                let message = if !plan.contains(&reference.step_id) {
                    format!(
                        "step '{}' references {} but step '{}' is missing from the plan",
                        step.id, reference, reference.step_id
                    )
                } else if !step.deps.contains(&reference.step_id) {
                    format!(
                        "step '{}' references {} without listing '{}' in deps",
                        step.id, reference, reference.step_id
                    )
                } else {
                    continue;
                };
                reported.push(reference.step_id.clone());
                issues.push(Issue::error(
                    IssueKind::UnresolvedDependency,
                    Some(&step.id),
                    message,
                ));
            }

            if step.max_retries > self.max_retries_cap {
                issues.push(Issue {
                    severity: Severity::Warning,
                    ..Issue::error(
                        IssueKind::RetryBoundExceeded,
                        Some(&step.id),
                        format!(
                            "step '{}' max_retries {} exceeds cap {}",
                            step.id, step.max_retries, self.max_retries_cap
                        ),
                    )
                });
            }
        }

        check_cycles(plan, &mut issues);

        let outstanding = plan
            .steps
            .iter()
            .filter(|s| s.status != StepStatus::Completed)
            .count() as u64;
        if let Some(remaining) = budget.remaining_steps() {
            if outstanding > remaining {
                issues.push(Issue::error(
                    IssueKind::BudgetInfeasible,
                    None,
                    format!(
                        "plan needs at least {outstanding} step executions but only {remaining} remain in the step budget"
                    ),
                ));
            }
        }

        ValidationReport::from_issues(issues)
    }
}

/// 默认上限下的便捷入口
pub fn validate(plan: &Plan, catalog: &ToolCatalog, budget: &Budget) -> ValidationReport {
    PlanValidator::default().validate(plan, catalog, budget)
}

fn check_duplicates(plan: &Plan, issues: &mut Vec<Issue>) {
    let mut seen: Vec<&str> = Vec::new();
    let mut reported: Vec<&str> = Vec::new();
    for step in &plan.steps {
        if seen.contains(&step.id.as_str()) {
            if !reported.contains(&step.id.as_str()) {
                reported.push(&step.id);
                issues.push(Issue::error(
                    IssueKind::DuplicateStepId,
                    Some(&step.id),
                    format!("step id '{}' is declared more than once", step.id),
                ));
            }
        } else {
            seen.push(&step.id);
        }
    }
}

/// 自依赖已单独报告，环检测在去掉自环的视图上进行
fn check_cycles(plan: &Plan, issues: &mut Vec<Issue>) {
    let mut view = plan.clone();
    for step in &mut view.steps {
        let id = step.id.clone();
        step.deps.retain(|d| d != &id);
    }
    if let Some(cycle) = PlanGraph::new(&view).find_cycle() {
        issues.push(Issue::error(
            IssueKind::CycleDetected,
            cycle.first().map(String::as_str),
            format!("dependency cycle: {}", cycle.join(" -> ")),
        ));
    }
}

/// 工具名切分为小写 token（下划线、连字符、空格、驼峰），去掉简单复数
fn name_tokens(name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch == '_' || ch == '-' || ch == ' ' || ch == '.' {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower && !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
        prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
        current.extend(ch.to_lowercase());
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
        .into_iter()
        .map(|t| {
            if t.len() > 3 && t.ends_with('s') && !t.ends_with("ss") {
                t[..t.len() - 1].to_string()
            } else {
                t
            }
        })
        .collect()
}

/// 为未知工具名给出候选：先查别名表（仅保留目录中存在的），没有命中再按共享 token 匹配
pub fn suggest_tools(unknown: &str, catalog: &ToolCatalog) -> Vec<String> {
    let tokens = name_tokens(unknown);
    let mut out: Vec<String> = Vec::new();

    for alias in TOOL_ALIASES {
        let matched = alias.tokens.iter().all(|p| tokens.iter().any(|t| t == p));
        if matched && catalog.contains(alias.tool) && !out.iter().any(|o| o == alias.tool) {
            out.push(alias.tool.to_string());
        }
    }
    if !out.is_empty() {
        return out;
    }

    for name in catalog.names() {
        let shared = name_tokens(name)
            .iter()
            .any(|t| t.len() >= 3 && tokens.contains(t));
        if shared && !out.iter().any(|o| o == name) {
            out.push(name.to_string());
        }
    }
    out
}
