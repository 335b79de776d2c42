//! 规划侧的 Oracle：Plan Generator、Critic（步骤评估）、Failure Reflector
//!
//! 三者都是窄 async trait，LLM 适配器在此实现；确定性核心只依赖 trait。

pub mod critic;
pub mod generator;
pub mod parse;
pub mod reflector;

pub use critic::{Critic, Evaluation, EvaluationAction, StepEvaluator};
pub use generator::{LlmPlanGenerator, PlanCandidate, PlanGenerator, PlanRequest, RepairMode};
pub use reflector::{FailureReflector, LlmFailureReflector, Reflection, ReflectionRequest};
