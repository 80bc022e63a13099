//! 错误类型与恢复动作
//!
//! HandleError 在 Round 内由 RecoveryEngine 消化，不会原样传出；SessionError 只表示契约违规。

use thiserror::Error;

use crate::actuator::ActuatorError;
use crate::core::context::{ContextKey, ValueKind};
use crate::llm::PromptError;

/// Context 读写违规
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContextError {
    #[error("context key {key:?} expects {expected:?}, got {actual:?}")]
    TypeMismatch {
        key: ContextKey,
        expected: ValueKind,
        actual: ValueKind,
    },
}

/// 智能体单步处理中的错误
#[derive(Error, Debug)]
pub enum HandleError {
    #[error("decision error: {0}")]
    Decision(#[from] PromptError),

    #[error("actuation error: {0}")]
    Actuation(#[from] ActuatorError),

    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// 会话层错误（未知会话、模式、计划文件等）
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("unsupported session mode: {0}")]
    UnsupportedMode(String),

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already started: {0}")]
    AlreadyStarted(String),

    #[error("no snapshot available for session {0}")]
    NoSnapshot(String),

    #[error("plan error: {0}")]
    Plan(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// 恢复引擎给出的动作
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryAction {
    /// 把失败写入智能体记忆，状态置为 CONTINUE 后重新决策
    RetryWithPrompt(String),
    /// 本轮以 ERROR 结束
    Abort(String),
}
