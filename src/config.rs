//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `WINPILOT__*` 覆盖（双下划线表示嵌套，如 `WINPILOT__SESSION__MAX_STEP=30`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub session: SessionSection,
    pub llm: LlmSection,
    pub experience: ExperienceSection,
}

/// [app] 段：日志目录、会话快照目录、演练模式下的候选窗口
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话日志根目录，每个任务一个子目录（logs/<task>/）
    pub log_root: PathBuf,
    /// fork / persist 快照存放目录
    pub snapshot_dir: PathBuf,
    /// DryRunActuator 暴露的窗口标题（无真实 UI 自动化时使用）
    pub dry_run_windows: Vec<String>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            log_root: PathBuf::from("logs"),
            snapshot_dir: PathBuf::from("stored_sessions"),
            dry_run_windows: vec!["Untitled - Notepad".into()],
        }
    }
}

/// [session] 段：步数预算、评估开关、敏感操作确认
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 整个会话允许的最大决策步数（超出即 MAX_STEP_REACHED）
    pub max_step: u64,
    /// 会话结束后是否调用 Evaluator
    pub eva_session: bool,
    /// 每轮结束后是否调用 Evaluator
    pub eva_round: bool,
    /// 委托智能体给出 CONFIRM 时是否等待用户确认
    pub safe_guard: bool,
    /// 协调者选中应用后是否等待外部解锁（unlock_confirmation）
    pub confirm_app_selection: bool,
    /// 会话完成后是否询问保存经验
    pub ask_experience: bool,
    /// 单个智能体记忆条数上限
    pub memory_limit: usize,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            max_step: 50,
            eva_session: false,
            eva_round: false,
            safe_guard: true,
            confirm_app_selection: false,
            ask_experience: true,
            memory_limit: 100,
        }
    }
}

/// [llm] 段：后端选择与计费
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / mock；未设置 API Key 时自动退回 mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 每千 token 的费用（美元），用于估算轮次 / 会话成本；0 表示不可用
    pub cost_per_1k_tokens: f64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            cost_per_1k_tokens: 0.0,
        }
    }
}

/// [experience] 段：经验存储位置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExperienceSection {
    pub saved_path: PathBuf,
}

impl Default for ExperienceSection {
    fn default() -> Self {
        Self {
            saved_path: PathBuf::from("experience"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 WINPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 WINPILOT__*（双下划线表示嵌套键）
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
        config::Environment::with_prefix("WINPILOT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
