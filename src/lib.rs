//! Winpilot - Windows 桌面智能体编排核心
//!
//! 模块划分：
//! - **actuator**: 执行器抽象（窗口枚举、动作执行、快照）与演练实现
//! - **agent**: 协调者 / 委托者 / 评估者
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机、上下文、轮次、会话、会话管理、监管与快照
//! - **experience**: 会话经验总结与保存
//! - **interaction**: 请求与确认的输入源
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）、决策 Prompter
//! - **memory**: 智能体记忆与黑板
//! - **observability**: tracing 初始化与会话 JSONL 日志

pub mod actuator;
pub mod agent;
pub mod config;
pub mod core;
pub mod experience;
pub mod interaction;
pub mod llm;
pub mod memory;
pub mod observability;

pub use crate::core::{SessionManager, SessionStatus};
