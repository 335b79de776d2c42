//! 计划模型与执行：Step / Plan、依赖图、引用解析、Artifact Store、预算、校验与调度

pub mod artifacts;
pub mod budget;
pub mod builder;
pub mod graph;
pub mod reference;
pub mod scheduler;
pub mod schema;
pub mod types;
pub mod validator;

pub use artifacts::{Artifact, ArtifactStore};
pub use budget::{Budget, BudgetKind, Counter};
pub use builder::PlanBuilder;
pub use graph::PlanGraph;
pub use scheduler::{RunOutcome, Scheduler, StepFailure};
pub use types::*;
pub use validator::{IssueKind, PlanValidator, Severity, ValidationReport};
