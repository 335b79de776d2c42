//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `TASKPILOT__*` 覆盖（双下划线表示嵌套，如 `TASKPILOT__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::OrchestratorError;
use crate::workflow::budget::Budget;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub budget: BudgetSection,
    pub orchestrator: OrchestratorSection,
    pub evaluation: EvaluationSection,
}

/// [app] 段：应用名、检查点目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub checkpoint_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            checkpoint_dir: PathBuf::from(".taskpilot/checkpoints"),
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：mock / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
        }
    }
}

/// [tools] 段：工具超时、重试默认值与上限、文件系统根
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）；Step.timeout_s 可覆盖
    pub tool_timeout_secs: u64,
    pub default_max_retries: u32,
    /// 超过此值的 max_retries 只给 warning
    pub max_retries_cap: u32,
    /// list_dir / read_file 的沙箱根，未设置时用当前目录
    pub filesystem_root: Option<PathBuf>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            default_max_retries: 2,
            max_retries_cap: 5,
            filesystem_root: None,
        }
    }
}

/// [budget] 段；max_tokens = 0 表示不限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetSection {
    pub max_tokens: u64,
    pub max_wall_secs: u64,
    pub max_steps: u64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            max_tokens: 0,
            max_wall_secs: 600,
            max_steps: 50,
        }
    }
}

impl BudgetSection {
    pub fn to_budget(&self) -> Budget {
        let tokens = (self.max_tokens > 0).then_some(self.max_tokens);
        Budget::new(tokens, self.max_wall_secs, self.max_steps)
    }
}

/// [orchestrator] 段：重规划上限与局部/全局修复策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub max_replans: u32,
    pub local_repair_max_failed_steps: usize,
    pub local_repairs_before_global: u32,
    /// Plan Generator / Failure Reflector 调用超时（秒）
    pub oracle_timeout_secs: u64,
    /// 是否写检查点
    pub checkpoint: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_replans: 3,
            local_repair_max_failed_steps: 2,
            local_repairs_before_global: 2,
            oracle_timeout_secs: 60,
            checkpoint: true,
        }
    }
}

/// [evaluation] 段：Critic 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EvaluationSection {
    pub enabled: bool,
    /// Critic 要求重规划且置信度不低于此值时才强制重规划
    pub replan_confidence_threshold: f64,
    pub evaluate_all_tools: bool,
    /// evaluate_all_tools = false 时仅评估这些工具
    pub evaluate_tools: Vec<String>,
    /// 为空时用内置模板；占位符 {goal} {step} {tool} {criteria} {result}
    pub prompt_template: String,
}

impl Default for EvaluationSection {
    fn default() -> Self {
        Self {
            enabled: true,
            replan_confidence_threshold: 0.7,
            evaluate_all_tools: true,
            evaluate_tools: Vec::new(),
            prompt_template: String::new(),
        }
    }
}

impl AppConfig {
    /// 语义校验：步数与秒数上限必须 > 0，阈值在 [0, 1]
    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.budget.max_steps == 0 {
            return Err(OrchestratorError::ConfigError(
                "budget.max_steps must be greater than 0".to_string(),
            ));
        }
        if self.budget.max_wall_secs == 0 {
            return Err(OrchestratorError::ConfigError(
                "budget.max_wall_secs must be greater than 0".to_string(),
            ));
        }
        let threshold = self.evaluation.replan_confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(OrchestratorError::ConfigError(format!(
                "evaluation.replan_confidence_threshold must be within [0, 1], got {threshold}"
            )));
        }
        if self.tools.tool_timeout_secs == 0 {
            return Err(OrchestratorError::ConfigError(
                "tools.tool_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 TASKPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 TASKPILOT__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("TASKPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.budget.max_steps, 50);
        assert_eq!(config.orchestrator.max_replans, 3);
        assert_eq!(config.tools.default_max_retries, 2);
        assert!((config.evaluation.replan_confidence_threshold - 0.7).abs() < f64::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_tokens_means_unlimited() {
        let budget = BudgetSection::default().to_budget();
        assert_eq!(budget.tokens.ceiling, None);
        assert_eq!(budget.steps.ceiling, Some(50));
        assert_eq!(budget.wall_secs.ceiling, Some(600));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.budget.max_steps = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.evaluation.replan_confidence_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[budget]\nmax_steps = 7\n\n[orchestrator]\nmax_replans = 1\n\n[evaluation]\nevaluate_all_tools = false\nevaluate_tools = [\"read_file\"]"
        )
        .unwrap();
        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.budget.max_steps, 7);
        assert_eq!(config.budget.max_wall_secs, 600);
        assert_eq!(config.orchestrator.max_replans, 1);
        assert_eq!(config.evaluation.evaluate_tools, vec!["read_file"]);
    }
}
