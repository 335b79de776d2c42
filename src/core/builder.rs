//! Orchestrator 构建器：统一的初始化逻辑
//!
//! CLI 与测试共用同一套组装方式：从 AppConfig 得到 LLM、工具注册表、Critic、检查点目录与预算，
//! 任何组件都可以用 `with_*` 替换（测试里换成 ScriptedLlmClient 或自定义 oracle）。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::events::EventSender;
use crate::core::orchestrator::Orchestrator;
use crate::core::RecoveryEngine;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient, UsageMeter};
use crate::persistence::CheckpointStore;
use crate::planning::{
    Critic, FailureReflector, LlmFailureReflector, LlmPlanGenerator, PlanGenerator, StepEvaluator,
};
use crate::tools::{EchoTool, ListDirTool, ReadFileTool, ToolExecutor, ToolRegistry};
use crate::workflow::validator::PlanValidator;

/// 根据配置选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    match cfg.llm.provider.to_lowercase().as_str() {
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY").ok();
            if api_key.is_none() {
                tracing::warn!("OPENAI_API_KEY is not set, requests will likely be rejected");
            }
            tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
            Arc::new(OpenAiClient::new(
                cfg.llm.base_url.as_deref(),
                &cfg.llm.model,
                api_key.as_deref(),
            ))
        }
        "mock" => Arc::new(MockLlmClient),
        other => {
            tracing::warn!(provider = %other, "Unknown LLM provider, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    }
}

/// 内置工具：echo、list_dir、read_file（后两者限制在 tools.filesystem_root 内）
pub fn default_tool_registry(cfg: &AppConfig) -> ToolRegistry {
    let root = cfg
        .tools
        .filesystem_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let mut tools = ToolRegistry::new();
    tools.register(EchoTool);
    tools.register(ListDirTool::new(&root));
    tools.register(ReadFileTool::new(&root));
    tools
}

/// Orchestrator 构建器
pub struct OrchestratorBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    generator: Option<Arc<dyn PlanGenerator>>,
    reflector: Option<Arc<dyn FailureReflector>>,
    evaluator: Option<Arc<dyn StepEvaluator>>,
    enable_evaluator: bool,
    registry: Option<ToolRegistry>,
    checkpoints: Option<CheckpointStore>,
    enable_checkpoints: bool,
    cancel: Option<CancellationToken>,
    events: Option<EventSender>,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    /// 使用默认配置
    pub fn new() -> Self {
        Self::from_config(AppConfig::default())
    }

    pub fn from_config(config: AppConfig) -> Self {
        Self {
            enable_evaluator: config.evaluation.enabled,
            enable_checkpoints: config.orchestrator.checkpoint,
            config,
            llm: None,
            generator: None,
            reflector: None,
            evaluator: None,
            registry: None,
            checkpoints: None,
            cancel: None,
            events: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 设置 LLM（未单独设置的 Plan Generator / Reflector / Critic 都用它）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_generator(mut self, generator: Arc<dyn PlanGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn with_reflector(mut self, reflector: Arc<dyn FailureReflector>) -> Self {
        self.reflector = Some(reflector);
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn StepEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self.enable_evaluator = true;
        self
    }

    /// 关闭结果评估
    pub fn without_evaluator(mut self) -> Self {
        self.evaluator = None;
        self.enable_evaluator = false;
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// 检查点写到指定目录
    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoints = Some(CheckpointStore::new(dir));
        self.enable_checkpoints = true;
        self
    }

    pub fn without_checkpoints(mut self) -> Self {
        self.checkpoints = None;
        self.enable_checkpoints = false;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// 构建 LLM 客户端
    pub fn build_llm(&self) -> Arc<dyn LlmClient> {
        self.llm
            .clone()
            .unwrap_or_else(|| create_llm_from_config(&self.config))
    }

    /// 构建 Critic（评估关闭时为 None）
    pub fn build_evaluator(&self, llm: Arc<dyn LlmClient>) -> Option<Arc<dyn StepEvaluator>> {
        if !self.enable_evaluator {
            return None;
        }
        if let Some(evaluator) = &self.evaluator {
            return Some(evaluator.clone());
        }
        let timeout = Duration::from_secs(self.config.llm.request_timeout_secs);
        Some(Arc::new(Critic::from_config(llm, &self.config.evaluation, timeout)))
    }

    pub fn build(self) -> Orchestrator {
        let llm = self.build_llm();
        let evaluator = self.build_evaluator(llm.clone());
        let cfg = &self.config;

        let generator = self.generator.clone().unwrap_or_else(|| {
            Arc::new(
                LlmPlanGenerator::new(llm.clone())
                    .with_default_max_retries(cfg.tools.default_max_retries),
            )
        });
        let reflector = self
            .reflector
            .clone()
            .unwrap_or_else(|| Arc::new(LlmFailureReflector::new(llm.clone())));
        let registry = self
            .registry
            .unwrap_or_else(|| default_tool_registry(cfg));
        let checkpoints = if self.enable_checkpoints {
            Some(
                self.checkpoints
                    .unwrap_or_else(|| CheckpointStore::new(cfg.app.checkpoint_dir.clone())),
            )
        } else {
            None
        };
        tracing::debug!(
            tools = ?registry.tool_names(),
            evaluator = evaluator.is_some(),
            checkpoints = checkpoints.is_some(),
            "orchestrator assembled"
        );

        Orchestrator {
            generator,
            reflector,
            evaluator,
            executor: Arc::new(ToolExecutor::new(registry, cfg.tools.tool_timeout_secs)),
            validator: PlanValidator::new(cfg.tools.max_retries_cap),
            recovery: RecoveryEngine::new(
                cfg.orchestrator.max_replans,
                cfg.orchestrator.local_repair_max_failed_steps,
                cfg.orchestrator.local_repairs_before_global,
            ),
            budget: cfg.budget.to_budget(),
            replan_threshold: cfg.evaluation.replan_confidence_threshold,
            oracle_timeout: Duration::from_secs(cfg.orchestrator.oracle_timeout_secs),
            checkpoints,
            cancel: self.cancel.unwrap_or_default(),
            events: self.events,
            oracle_usage: Arc::new(UsageMeter::new(llm)),
        }
    }
}
