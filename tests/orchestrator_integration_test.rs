//! Orchestrator 端到端测试：局部修复、全局重规划、断点续跑、取消、评估触发重规划

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use taskpilot::config::AppConfig;
use taskpilot::core::{OrchestratorBuilder, OrchestratorError, RunStatus, Terminal};
use taskpilot::llm::ScriptedLlmClient;
use taskpilot::persistence::CheckpointStore;
use taskpilot::planning::{
    Evaluation, EvaluationAction, FailureReflector, LlmPlanGenerator, Reflection, ReflectionRequest,
    StepEvaluator,
};
use taskpilot::tools::{EchoTool, Tool, ToolRegistry};
use taskpilot::workflow::{PlanBuilder, Step, StepStatus};

/// 每次调用都计数，返回 `{"text": "data"}`，可附带 token 消耗
struct FetchTool {
    calls: Arc<AtomicUsize>,
    tokens: u64,
}

#[async_trait]
impl Tool for FetchTool {
    fn name(&self) -> &str {
        "fetch"
    }

    fn description(&self) -> &str {
        "Fetch data. Result fields: text"
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "ok": true, "text": "data", "tokens_used": self.tokens }))
    }
}

/// 总是失败的工具
struct FlakyTool {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for FlakyTool {
    fn name(&self) -> &str {
        "flaky"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("upstream unavailable".to_string())
    }
}

struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleeps for a long time"
    }

    async fn execute(&self, _args: Value) -> Result<Value, String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!({ "ok": true }))
    }
}

#[derive(Default)]
struct CountingReflector {
    calls: AtomicUsize,
}

#[async_trait]
impl FailureReflector for CountingReflector {
    async fn reflect(&self, request: &ReflectionRequest) -> Result<Reflection, OrchestratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Reflection {
            root_cause: format!("upstream down ({})", request.error_message),
            corrective_actions: vec!["use echo instead".to_string()],
            retry_recommended: false,
        })
    }
}

/// 对 fetch 的结果给出高置信度「需要重规划」，其它一律通过
struct RejectFetch;

#[async_trait]
impl StepEvaluator for RejectFetch {
    async fn evaluate(
        &self,
        _goal: &str,
        step: &Step,
        _result: &Map<String, Value>,
    ) -> Result<Evaluation, OrchestratorError> {
        if step.tool == "fetch" {
            Ok(Evaluation::failed(
                EvaluationAction::Replan,
                0.9,
                vec!["data is stale".to_string()],
            ))
        } else {
            Ok(Evaluation::passed())
        }
    }
}

struct Fixture {
    fetch_calls: Arc<AtomicUsize>,
    flaky_calls: Arc<AtomicUsize>,
    reflector: Arc<CountingReflector>,
    llm: Arc<ScriptedLlmClient>,
}

impl Fixture {
    fn new(replies: Vec<&str>) -> Self {
        Self {
            fetch_calls: Arc::new(AtomicUsize::new(0)),
            flaky_calls: Arc::new(AtomicUsize::new(0)),
            reflector: Arc::new(CountingReflector::default()),
            llm: Arc::new(ScriptedLlmClient::new(replies)),
        }
    }

    fn registry(&self, fetch_tokens: u64) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(SlowTool);
        registry.register(FetchTool {
            calls: self.fetch_calls.clone(),
            tokens: fetch_tokens,
        });
        registry.register(FlakyTool {
            calls: self.flaky_calls.clone(),
        });
        registry
    }

    fn builder(&self, config: AppConfig, fetch_tokens: u64) -> OrchestratorBuilder {
        OrchestratorBuilder::from_config(config)
            .with_llm(self.llm.clone())
            .with_generator(Arc::new(LlmPlanGenerator::new(self.llm.clone())))
            .with_reflector(self.reflector.clone())
            .with_registry(self.registry(fetch_tokens))
            .without_evaluator()
    }
}

#[tokio::test]
async fn test_failed_step_is_reflected_and_locally_repaired() {
    let fixture = Fixture::new(vec![
        r#"{"steps": [{"id": "b", "tool": "echo", "inputs": {"text": "fixed"}, "deps": ["a"]}]}"#,
    ]);
    let dir = tempfile::tempdir().unwrap();
    let orch = fixture
        .builder(AppConfig::default(), 0)
        .with_checkpoint_dir(dir.path())
        .build();

    let plan = PlanBuilder::new("summarize data")
        .step("a", "fetch")
        .step("b", "flaky")
        .max_retries("b", 2)
        .sequential("a", "b")
        .step("c", "echo")
        .input("c", "text", "$b.text")
        .depends_on("c", ["b"])
        .build();

    let mut state = orch.new_state("summarize data");
    let report = orch.drive(&mut state, Some(plan)).await.unwrap();

    assert_eq!(report.terminal, Some(Terminal::Completed));
    assert_eq!(report.status, RunStatus::Done);
    assert_eq!(fixture.flaky_calls.load(Ordering::SeqCst), 3);
    assert_eq!(fixture.reflector.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fixture.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.replans, 1);
    assert_eq!(report.generation, 1);
    assert_eq!(state.last_repair, Some(taskpilot::planning::RepairMode::Local));

    // 局部修复前后，已完成步骤的产出逐字节一致
    let store = CheckpointStore::new(dir.path());
    let before_repair = store
        .list(Some(state.run_id()))
        .unwrap()
        .into_iter()
        .find(|h| h.label == "step-a")
        .unwrap();
    let snapshot = store.load(&before_repair).unwrap();
    assert_eq!(
        serde_json::to_vec(snapshot.artifacts.get("a").unwrap()).unwrap(),
        serde_json::to_vec(state.artifacts.get("a").unwrap()).unwrap()
    );
    assert_eq!(state.artifacts.get("a").unwrap().generation, 0);
    assert_eq!(state.artifacts.field("c", "text"), Some(&json!("fixed")));
    assert_eq!(state.plan.step("b").unwrap().tool, "echo");
    assert!(report
        .notes
        .iter()
        .any(|n| n.starts_with("[reflector]") && n.contains("upstream down")));

    let prompt = &fixture.llm.prompts()[0];
    assert!(prompt.contains("Replace ONLY these failing steps: b"));
    assert!(prompt.contains("upstream down"));

    let labels: Vec<String> = CheckpointStore::new(dir.path())
        .list(Some(state.run_id()))
        .unwrap()
        .into_iter()
        .map(|h| h.label)
        .collect();
    assert_eq!(labels.first().map(String::as_str), Some("validated-g0"));
    assert!(labels.contains(&"step-b".to_string()));
    assert!(labels.contains(&"validated-g1".to_string()));
    assert_eq!(labels.last().map(String::as_str), Some("final"));
}

#[tokio::test]
async fn test_global_repair_keeps_completed_artifacts() {
    let fixture = Fixture::new(vec![
        r#"{"steps": [
            {"id": "a", "tool": "fetch"},
            {"id": "b2", "tool": "echo", "inputs": {"text": "$a.text"}, "deps": ["a"]}
        ]}"#,
    ]);
    let mut config = AppConfig::default();
    config.orchestrator.local_repair_max_failed_steps = 0;
    let orch = fixture.builder(config, 0).without_checkpoints().build();

    let plan = PlanBuilder::new("g")
        .step("a", "fetch")
        .step("b", "flaky")
        .max_retries("b", 0)
        .sequential("a", "b")
        .build();
    let mut state = orch.new_state("g");
    let report = orch.drive(&mut state, Some(plan)).await.unwrap();

    assert_eq!(report.terminal, Some(Terminal::Completed));
    assert_eq!(report.completed_steps, vec!["a", "b2"]);
    assert_eq!(fixture.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.last_repair, Some(taskpilot::planning::RepairMode::Global));
    assert_eq!(state.artifacts.field("b2", "text"), Some(&json!("data")));
}

#[tokio::test]
async fn test_local_repair_accepts_renamed_replacement() {
    let fixture = Fixture::new(vec![
        r#"{"steps": [{"id": "b_fixed", "tool": "echo", "inputs": {"text": "fixed"}, "deps": ["a"]}]}"#,
    ]);
    let orch = fixture
        .builder(AppConfig::default(), 0)
        .without_checkpoints()
        .build();

    let plan = PlanBuilder::new("g")
        .step("a", "fetch")
        .step("b", "flaky")
        .max_retries("b", 0)
        .sequential("a", "b")
        .step("c", "echo")
        .input("c", "text", "$b.text")
        .depends_on("c", ["b"])
        .build();
    let mut state = orch.new_state("g");
    let report = orch.drive(&mut state, Some(plan)).await.unwrap();

    assert_eq!(report.terminal, Some(Terminal::Completed));
    assert_eq!(report.replans, 1);
    assert_eq!(state.last_repair, Some(taskpilot::planning::RepairMode::Local));
    assert_eq!(state.plan.ids(), vec!["a", "b_fixed", "c"]);
    assert_eq!(state.artifacts.field("c", "text"), Some(&json!("fixed")));
    assert_eq!(fixture.fetch_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_global_repair_builds_on_completed_chain() {
    let fixture = Fixture::new(vec![
        r#"{"steps": [{"id": "d", "tool": "echo", "inputs": {"text": "$b.text"}, "deps": ["b"]}]}"#,
    ]);
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.orchestrator.local_repair_max_failed_steps = 0;
    let orch = fixture
        .builder(config, 0)
        .with_checkpoint_dir(dir.path())
        .build();

    let plan = PlanBuilder::new("g")
        .step("a", "fetch")
        .step("b", "echo")
        .input("b", "text", "$a.text")
        .depends_on("b", ["a"])
        .step("c", "flaky")
        .max_retries("c", 0)
        .depends_on("c", ["b"])
        .build();
    let mut state = orch.new_state("g");
    let report = orch.drive(&mut state, Some(plan)).await.unwrap();

    assert_eq!(report.terminal, Some(Terminal::Completed));
    assert_eq!(report.replans, 1);
    assert_eq!(report.completed_steps, vec!["a", "b", "d"]);
    assert_eq!(state.last_repair, Some(taskpilot::planning::RepairMode::Global));
    assert_eq!(fixture.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.artifacts.field("d", "text"), Some(&json!("data")));

    let store = CheckpointStore::new(dir.path());
    let before_repair = store
        .list(Some(state.run_id()))
        .unwrap()
        .into_iter()
        .find(|h| h.label == "step-c")
        .unwrap();
    let snapshot = store.load(&before_repair).unwrap();
    for id in ["a", "b"] {
        assert_eq!(
            serde_json::to_vec(snapshot.artifacts.get(id).unwrap()).unwrap(),
            serde_json::to_vec(state.artifacts.get(id).unwrap()).unwrap()
        );
    }
}

#[tokio::test]
async fn test_planner_tokens_count_against_budget() {
    let mut fixture = Fixture::new(vec![]);
    fixture.llm = Arc::new(
        ScriptedLlmClient::new([
            r#"{"steps": [{"id": "a", "tool": "echo", "inputs": {"text": "hi"}}]}"#,
        ])
        .with_tokens_per_reply(20),
    );
    let mut config = AppConfig::default();
    config.budget.max_tokens = 10;
    let orch = fixture.builder(config, 0).without_checkpoints().build();

    let report = orch.run_goal("say hi").await.unwrap();
    assert_eq!(
        report.terminal,
        Some(Terminal::PartialBudget {
            counter: taskpilot::workflow::BudgetKind::Tokens
        })
    );
    assert_eq!(report.pending_steps, vec!["a"]);
    assert_eq!(report.budget.tokens_used, 10);
    assert_eq!(report.budget.steps_used, 0);
}

#[tokio::test]
async fn test_resume_after_token_budget_exhausted() {
    let fixture = Fixture::new(vec![]);
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.budget.max_tokens = 5;
    let orch = fixture
        .builder(config, 10)
        .with_checkpoint_dir(dir.path())
        .build();

    let plan = PlanBuilder::new("g")
        .step("a", "fetch")
        .step("b", "echo")
        .input("b", "text", "$a.text")
        .depends_on("b", ["a"])
        .build();
    let report = orch.run_with_plan("g", plan).await.unwrap();
    assert!(report.partial);
    assert_eq!(
        report.terminal,
        Some(Terminal::PartialBudget {
            counter: taskpilot::workflow::BudgetKind::Tokens
        })
    );
    assert_eq!(report.completed_steps, vec!["a"]);
    assert_eq!(report.pending_steps, vec!["b"]);

    let store = CheckpointStore::new(dir.path());
    let handle = store.latest(&report.run_id).unwrap().unwrap();
    assert_eq!(handle.label, "final");
    let mut state = store.load(&handle).unwrap();

    // 新配置不限 token
    let resumed = fixture
        .builder(AppConfig::default(), 10)
        .with_checkpoint_dir(dir.path())
        .build();
    let report = resumed.resume(&mut state).await.unwrap();
    assert_eq!(report.terminal, Some(Terminal::Completed));
    assert_eq!(report.completed_steps, vec!["a", "b"]);
    assert_eq!(fixture.fetch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.artifacts.field("b", "text"), Some(&json!("data")));
}

#[tokio::test]
async fn test_cancellation_mid_step_returns_report() {
    let fixture = Fixture::new(vec![]);
    let orch = fixture
        .builder(AppConfig::default(), 0)
        .without_checkpoints()
        .build();
    let cancel = orch.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let plan = PlanBuilder::new("g").step("a", "slow").build();
    let mut state = orch.new_state("g");
    let report = orch.drive(&mut state, Some(plan)).await.unwrap();
    assert_eq!(report.terminal, Some(Terminal::Cancelled));
    assert_eq!(report.status, RunStatus::Error);
    assert_eq!(state.plan.status_of("a"), Some(StepStatus::Pending));
    assert!(state.artifacts.is_empty());
}

#[tokio::test]
async fn test_confident_criteria_failure_triggers_global_replan() {
    let fixture = Fixture::new(vec![
        r#"{"steps": [{"id": "a2", "tool": "echo", "inputs": {"text": "fresh"}}]}"#,
    ]);
    let orch = fixture
        .builder(AppConfig::default(), 0)
        .with_evaluator(Arc::new(RejectFetch))
        .without_checkpoints()
        .build();

    let plan = PlanBuilder::new("g")
        .step("a", "fetch")
        .criterion("a", "data is current")
        .build();
    let mut state = orch.new_state("g");
    let report = orch.drive(&mut state, Some(plan)).await.unwrap();

    assert_eq!(report.terminal, Some(Terminal::Completed));
    assert_eq!(report.replans, 1);
    assert!(!state.artifacts.contains("a"));
    assert_eq!(state.artifacts.field("a2", "text"), Some(&json!("fresh")));
    assert!(report.notes.iter().any(|n| n.contains("data is stale")));
}
