//! 核心编排层：状态机、上下文、轮次、会话、会话管理、监管、快照与恢复

pub mod context;
pub mod error;
pub mod manager;
pub mod plan;
pub mod recovery;
pub mod round;
pub mod session;
pub mod snapshot;
pub mod state;
pub mod supervisor;

pub use context::{Context, ContextKey, ContextValue};
pub use error::{ContextError, HandleError, RecoveryAction, SessionError};
pub use manager::{SessionHandle, SessionManager};
pub use plan::PlanReader;
pub use recovery::RecoveryEngine;
pub use round::{Round, RoundOutcome};
pub use session::{Session, SessionMode, SessionOutcome};
pub use snapshot::{SessionSnapshot, SnapshotStore};
pub use state::{AgentRef, AgentRole, AgentState, AgentStatus, ControlReply, SessionStatus, StateReply};
pub use supervisor::SessionControl;
