//! Winpilot - 命令行入口
//!
//! 初始化日志与配置，组装 LLM / 执行器 / 评估者 / 经验存储，创建会话并运行到结束。
//! `--store` 把结束时的会话快照写入 `app.snapshot_dir`，`--resume ID` 从中读回并续跑。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use winpilot::actuator::DryRunActuator;
use winpilot::agent::{Collaborators, LlmEvaluator};
use winpilot::config::load_config;
use winpilot::core::SnapshotStore;
use winpilot::experience::JsonExperienceStore;
use winpilot::interaction::StdinInput;
use winpilot::llm::{create_llm_from_config, LlmPrompter};
use winpilot::{observability, SessionManager};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// 从标准输入逐条读取请求
    Normal,
    /// 按计划文件（或目录下每个 *.json）回放
    Follower,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Follower => "follower",
        }
    }
}

#[derive(Parser)]
#[command(name = "winpilot", about = "Windows desktop agent orchestrator")]
#[command(version)]
struct Cli {
    /// 任务名，同时决定日志子目录
    #[arg(short, long, default_value = "default_task")]
    task: String,

    #[arg(short, long, value_enum, default_value_t = Mode::Normal)]
    mode: Mode,

    /// 跟随模式的计划文件或目录
    #[arg(short, long, required_if_eq("mode", "follower"))]
    plan: Option<PathBuf>,

    /// 额外的 TOML 配置文件
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 结束后把会话快照写入 snapshot_dir
    #[arg(long)]
    store: bool,

    /// 从 snapshot_dir 读回指定会话并续跑
    #[arg(long, conflicts_with = "plan")]
    resume: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cli = Cli::parse();
    let config = load_config(cli.config.clone()).context("Failed to load config")?;
    let store = SnapshotStore::new(&config.app.snapshot_dir);

    let llm = create_llm_from_config(&config.llm);
    let price = config.llm.cost_per_1k_tokens;
    let actuator = Arc::new(DryRunActuator::new(&config.app.dry_run_windows));
    let collaborators = Collaborators::new(
        Arc::new(LlmPrompter::coordinator(llm.clone()).with_price(price)),
        Arc::new(LlmPrompter::delegate(llm.clone()).with_price(price)),
        actuator,
    )
    .with_evaluator(Arc::new(LlmEvaluator::new(llm.clone(), price)))
    .with_experience(Arc::new(
        JsonExperienceStore::new(&config.experience.saved_path).with_llm(llm, price),
    ))
    .with_input(Arc::new(StdinInput::new()));

    let manager = SessionManager::new(config, collaborators);
    let (handles, id) = match &cli.resume {
        Some(id) => {
            let handles = manager
                .load(id, &store)
                .with_context(|| format!("Failed to load session {}", id))?;
            (handles, id.clone())
        }
        None => manager
            .create(&cli.task, cli.mode.as_str(), cli.plan.as_deref())
            .context("Failed to create session")?,
    };
    tracing::info!(session_id = %id, sessions = handles.len(), "starting");

    let worker = manager.start(&id).await.context("Failed to start session")?;
    let results = worker.await.context("Session worker panicked")?;
    for (handle, result) in handles.iter().zip(results) {
        let outcome = result.with_context(|| format!("Session {} failed", handle.task))?;
        tracing::info!(
            task = %handle.task,
            status = outcome.status.name(),
            rounds = outcome.rounds,
            steps = outcome.steps,
            cost = outcome.cost,
            "session outcome"
        );
    }

    if cli.store {
        let path = manager
            .store(&id, &store)
            .await
            .context("Failed to store session snapshot")?;
        tracing::info!(session_id = %id, path = %path.display(), "session snapshot stored");
    }
    Ok(())
}
