//! TaskPilot - Rust 任务编排核心
//!
//! 入口：初始化日志、加载配置、组装 Orchestrator，执行子命令（validate / run / resume / checkpoints / schema）。
//! 报告以 JSON 写 stdout，日志与过程事件写 stderr。

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use taskpilot::config::{load_config, AppConfig};
use taskpilot::core::{
    default_tool_registry, OrchestratorBuilder, RunEvent, RunReport, RunStatus, ShutdownManager,
};
use taskpilot::persistence::CheckpointStore;
use taskpilot::workflow::schema::plan_schema_json;
use taskpilot::workflow::validator::PlanValidator;
use taskpilot::workflow::Plan;

#[derive(Parser, Debug)]
#[command(name = "taskpilot", version, about = "Plan, validate, execute and repair tool-using task plans")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 把过程事件以 JSON 行写到 stderr
    #[arg(long, global = true)]
    events: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 校验计划文件，输出校验报告
    Validate {
        /// 计划 JSON 文件
        plan: PathBuf,
    },
    /// 执行一个目标
    Run {
        goal: String,
        /// 跳过初始规划，直接执行此计划文件
        #[arg(long)]
        plan: Option<PathBuf>,
    },
    /// 从检查点继续（检查点文件路径，或 run id 取其最新检查点）
    Resume { checkpoint: String },
    /// 列出检查点
    Checkpoints {
        #[arg(long)]
        run: Option<String>,
    },
    /// 打印计划 JSON Schema
    Schema,
}

#[tokio::main]
async fn main() -> ExitCode {
    taskpilot::observability::init();
    match run_cli(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_cli(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = load_config(cli.config.clone()).context("Failed to load config")?;
    config.validate().context("Invalid config")?;

    match cli.command {
        Commands::Schema => {
            println!("{}", plan_schema_json());
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { plan } => validate_plan(&config, &plan),
        Commands::Checkpoints { run } => {
            let store = CheckpointStore::new(config.app.checkpoint_dir.clone());
            let handles = store.list(run.as_deref()).context("Failed to list checkpoints")?;
            println!("{}", serde_json::to_string_pretty(&handles)?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run { goal, plan } => {
            let plan = plan.as_deref().map(read_plan).transpose()?;
            let (builder, shutdown) = assemble(&config, cli.events);
            let orchestrator = builder.build();
            shutdown.install_signal_handlers();
            let report = match plan {
                Some(plan) => orchestrator.run_with_plan(&goal, plan).await,
                None => orchestrator.run_goal(&goal).await,
            }
            .context("Run failed")?;
            print_report(&report)
        }
        Commands::Resume { checkpoint } => {
            let mut state = if Path::new(&checkpoint).is_file() {
                CheckpointStore::load_path(Path::new(&checkpoint))
                    .with_context(|| format!("Failed to load checkpoint {checkpoint}"))?
            } else {
                let store = CheckpointStore::new(config.app.checkpoint_dir.clone());
                let Some(handle) = store.latest(&checkpoint)? else {
                    bail!("no checkpoint found for run '{checkpoint}'");
                };
                tracing::info!(label = %handle.label, path = %handle.path.display(), "loading latest checkpoint");
                store.load(&handle)?
            };
            let (builder, shutdown) = assemble(&config, cli.events);
            let orchestrator = builder.build();
            shutdown.install_signal_handlers();
            let report = orchestrator.resume(&mut state).await.context("Resume failed")?;
            print_report(&report)
        }
    }
}

/// 组装 OrchestratorBuilder 与关闭管理器；--events 时启动事件打印任务
fn assemble(config: &AppConfig, print_events: bool) -> (OrchestratorBuilder, Arc<ShutdownManager>) {
    let shutdown = Arc::new(ShutdownManager::new());
    let mut builder = OrchestratorBuilder::from_config(config.clone()).with_cancel_token(shutdown.token());
    if print_events {
        let (tx, mut rx) = mpsc::unbounded_channel::<RunEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
            }
        });
        builder = builder.with_events(tx);
    }
    (builder, shutdown)
}

fn read_plan(path: &Path) -> anyhow::Result<Plan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan file {}", path.display()))?;
    Plan::from_json(&raw).with_context(|| format!("Invalid plan file {}", path.display()))
}

fn validate_plan(config: &AppConfig, path: &Path) -> anyhow::Result<ExitCode> {
    let plan = read_plan(path)?;
    let catalog = default_tool_registry(config).catalog();
    let report = PlanValidator::new(config.tools.max_retries_cap).validate(
        &plan,
        &catalog,
        &config.budget.to_budget(),
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(if report.ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &RunReport) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(if report.status == RunStatus::Done {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
