//! 会话快照与持久化
//!
//! SessionSnapshot 是会话的可序列化深拷贝（不含活动窗口句柄与日志句柄），用于 fork / persist / load。
//! SnapshotStore 把快照写成单个 JSON 文件 `session_<id>.json`。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::actuator::{Action, WindowDescriptor};
use crate::agent::{CoordinatorAgent, EvaluationResult};
use crate::core::context::{Context, ContextSnapshot};
use crate::core::round::RoundOutcome;
use crate::core::session::SessionMode;
use crate::core::state::{AgentRef, AgentState, AgentStatus};
use crate::core::supervisor::SessionControl;
use crate::core::SessionError;
use crate::memory::{Blackboard, Memory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub id: u32,
    pub request: String,
    pub state: AgentState,
    pub agent: AgentRef,
    pub handles: u64,
    /// None 表示该轮尚未结束
    pub outcome: Option<RoundOutcome>,
    #[serde(default)]
    pub evaluation: Option<EvaluationResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateSnapshot {
    pub name: String,
    pub app_name: String,
    pub root_name: String,
    pub state: AgentState,
    pub status: AgentStatus,
    pub step: u64,
    pub memory: Memory,
    pub window: Option<WindowDescriptor>,
    #[serde(default)]
    pub pending_action: Option<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSnapshot {
    pub name: String,
    pub state: AgentState,
    pub status: AgentStatus,
    pub step: u64,
    pub memory: Memory,
    pub blackboard: Blackboard,
    pub delegates: Vec<DelegateSnapshot>,
    pub active: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub task: String,
    pub mode: SessionMode,
    pub finished: bool,
    pub rounds: Vec<RoundSnapshot>,
    pub context: ContextSnapshot,
    pub coordinator: CoordinatorSnapshot,
    pub taken_at: String,
}

impl SessionSnapshot {
    /// 最近一轮的状态名（fork 后用于发布 get_state）
    pub fn last_round_state(&self) -> Option<AgentState> {
        self.rounds.last().map(|r| r.state)
    }
}

/// 快照文件存储
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("session_{}.json", id))
    }

    /// 写入快照；目录不存在时自动创建
    pub fn save(&self, id: &str, snapshot: &SessionSnapshot) -> Result<PathBuf, SessionError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(id);
        std::fs::write(&path, serde_json::to_string_pretty(snapshot)?)?;
        tracing::info!(session_id = %id, path = %path.display(), "session snapshot stored");
        Ok(path)
    }

    pub fn load(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// 会话头信息 + 已结束轮次；Round 每步结束后用它拼出完整快照并发布到控制面
#[derive(Debug, Clone)]
pub struct SnapshotPublisher {
    pub id: String,
    pub task: String,
    pub mode: SessionMode,
    pub finished: bool,
    pub history: Vec<RoundSnapshot>,
}

impl SnapshotPublisher {
    pub fn build(
        &self,
        current: Option<RoundSnapshot>,
        context: &Context,
        coordinator: &CoordinatorAgent,
    ) -> SessionSnapshot {
        let mut rounds = self.history.clone();
        rounds.extend(current);
        SessionSnapshot {
            id: self.id.clone(),
            task: self.task.clone(),
            mode: self.mode.clone(),
            finished: self.finished,
            rounds,
            context: context.snapshot(),
            coordinator: coordinator.snapshot(),
            taken_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn publish(
        &self,
        control: &SessionControl,
        current: RoundSnapshot,
        context: &Context,
        coordinator: &CoordinatorAgent,
    ) {
        control.publish_snapshot(self.build(Some(current), context, coordinator));
    }
}
