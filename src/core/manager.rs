//! 会话管理器：进程级会话注册表
//!
//! 同一 id 下可有多个会话（跟随模式批量计划），由一个工作任务依次运行。
//! 控制面操作（暂停、恢复、终止、解锁、fork、持久化）全部经由各会话的 SessionControl。

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::agent::Collaborators;
use crate::config::AppConfig;
use crate::core::plan::PlanReader;
use crate::core::session::{Session, SessionMode, SessionOutcome};
use crate::core::snapshot::{SessionSnapshot, SnapshotStore};
use crate::core::state::{ControlReply, SessionStatus, StateReply};
use crate::core::supervisor::SessionControl;
use crate::core::SessionError;
use crate::interaction::Confirmation;

/// 注册表中的一个会话：控制面句柄 + 尚未被工作任务取走的会话本体
pub struct ManagedSession {
    task: String,
    control: Arc<SessionControl>,
    session: Mutex<Option<Session>>,
}

impl ManagedSession {
    fn new(session: Session) -> Self {
        Self {
            task: session.task().to_string(),
            control: session.control().clone(),
            session: Mutex::new(Some(session)),
        }
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn control(&self) -> &Arc<SessionControl> {
        &self.control
    }
}

/// create() 返回给调用方的会话句柄
#[derive(Clone)]
pub struct SessionHandle {
    pub task: String,
    pub control: Arc<SessionControl>,
}

type SessionResults = Vec<Result<SessionOutcome, SessionError>>;

pub struct SessionManager {
    config: AppConfig,
    collaborators: Collaborators,
    sessions: RwLock<HashMap<String, Vec<Arc<ManagedSession>>>>,
    /// 全局应用选择确认锁，所有会话共享
    confirmation_locked: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Self {
        let locked = config.session.confirm_app_selection;
        Self {
            config,
            collaborators,
            sessions: RwLock::new(HashMap::new()),
            confirmation_locked: Arc::new(AtomicBool::new(locked)),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn new_control(&self) -> Arc<SessionControl> {
        Arc::new(SessionControl::new(self.confirmation_locked.clone()))
    }

    fn entries(&self, id: &str) -> Result<Vec<Arc<ManagedSession>>, SessionError> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    fn register(&self, id: &str, sessions: Vec<Session>) -> Vec<SessionHandle> {
        let managed: Vec<Arc<ManagedSession>> = sessions
            .into_iter()
            .map(|s| Arc::new(ManagedSession::new(s)))
            .collect();
        let handles = managed
            .iter()
            .map(|m| SessionHandle {
                task: m.task.clone(),
                control: m.control.clone(),
            })
            .collect();
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.to_string())
            .or_default()
            .extend(managed);
        handles
    }

    /// 创建会话：normal 一个；follower 按计划文件（或目录下每个 *.json）各一个，共用同一 id
    pub fn create(
        &self,
        task: &str,
        mode: &str,
        plan: Option<&Path>,
    ) -> Result<(Vec<SessionHandle>, String), SessionError> {
        let id = uuid::Uuid::new_v4().to_string();
        let sessions = match mode.to_lowercase().as_str() {
            "normal" => vec![Session::new(
                id.clone(),
                task,
                SessionMode::Normal,
                &self.config,
                self.collaborators.clone(),
                self.new_control(),
            )?],
            "follower" => {
                let plan = plan.ok_or_else(|| SessionError::Plan("follower mode needs a plan path".into()))?;
                self.follower_sessions(&id, task, plan)?
            }
            other => return Err(SessionError::UnsupportedMode(other.to_string())),
        };
        tracing::info!(session_id = %id, task = %task, mode = %mode, count = sessions.len(), "sessions created");
        let handles = self.register(&id, sessions);
        Ok((handles, id))
    }

    fn follower_sessions(&self, id: &str, task: &str, plan: &Path) -> Result<Vec<Session>, SessionError> {
        let mut files: Vec<(String, std::path::PathBuf)> = if plan.is_dir() {
            std::fs::read_dir(plan)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("json"))
                .map(|path| {
                    let stem = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .unwrap_or_default()
                        .to_string();
                    (format!("{}/{}", task, stem), path)
                })
                .collect()
        } else {
            vec![(task.to_string(), plan.to_path_buf())]
        };
        files.sort_by(|a, b| a.1.cmp(&b.1));

        files
            .into_iter()
            .map(|(name, path)| {
                let reader = PlanReader::load(&path)?;
                Session::new(
                    id,
                    name,
                    SessionMode::Follower(reader),
                    &self.config,
                    self.collaborators.clone(),
                    self.new_control(),
                )
            })
            .collect()
    }

    /// 启动一个工作任务，依次运行该 id 下尚未运行的会话
    pub async fn start(&self, id: &str) -> Result<JoinHandle<SessionResults>, SessionError> {
        let mut sessions = Vec::new();
        for entry in self.entries(id)? {
            if let Some(session) = entry.session.lock().await.take() {
                sessions.push(session);
            }
        }
        if sessions.is_empty() {
            return Err(SessionError::AlreadyStarted(id.to_string()));
        }

        let actuator = self.collaborators.actuator.clone();
        let id = id.to_string();
        Ok(tokio::spawn(async move {
            let mut results = Vec::with_capacity(sessions.len());
            for mut session in sessions {
                tracing::info!(session_id = %id, task = %session.task(), "session worker started");
                session.resolve_windows(actuator.as_ref()).await;
                results.push(session.run().await);
            }
            results
        }))
    }

    /// 最近一个有活动轮次的会话的轮次状态
    pub fn get_state(&self, id: &str) -> StateReply {
        let Ok(entries) = self.entries(id) else {
            return StateReply::NoSessionRunning;
        };
        entries
            .iter()
            .rev()
            .find_map(|e| e.control.round_state())
            .map(|state| StateReply::State(state.name().to_string()))
            .unwrap_or(StateReply::NoSessionRunning)
    }

    pub fn pause(&self, id: &str) -> ControlReply {
        self.for_running(id, |control| control.pause())
    }

    pub fn resume(&self, id: &str) -> ControlReply {
        self.for_running(id, |control| control.resume())
    }

    fn for_running(&self, id: &str, op: impl Fn(&SessionControl) -> ControlReply) -> ControlReply {
        let Ok(entries) = self.entries(id) else {
            return ControlReply::NoSessionRunning;
        };
        entries
            .iter()
            .map(|e| op(e.control.as_ref()))
            .fold(ControlReply::NoSessionRunning, |acc, reply| {
                if reply == ControlReply::Ok {
                    ControlReply::Ok
                } else {
                    acc
                }
            })
    }

    /// 终止该 id 下所有会话；终止优先于暂停
    pub fn terminate(&self, id: &str) -> Result<(), SessionError> {
        for entry in self.entries(id)? {
            entry.control.terminate();
        }
        tracing::info!(session_id = %id, "terminate requested");
        Ok(())
    }

    /// 放行正在等待应用选择确认的会话（一次）
    pub fn unlock_confirmation(&self, id: &str) -> Result<(), SessionError> {
        for entry in self.entries(id)? {
            entry.control.unlock_selection();
        }
        Ok(())
    }

    pub fn set_confirmation_lock(&self, locked: bool) {
        self.confirmation_locked.store(locked, Ordering::SeqCst);
    }

    pub fn confirmation_locked(&self) -> bool {
        self.confirmation_locked.load(Ordering::SeqCst)
    }

    /// 最新快照：优先取工作任务发布的，否则取尚未启动的会话本体
    async fn latest_snapshot(&self, id: &str) -> Result<SessionSnapshot, SessionError> {
        let entries = self.entries(id)?;
        for entry in entries.iter().rev() {
            if let Some(snapshot) = entry.control.latest_snapshot() {
                return Ok(snapshot);
            }
            if let Some(session) = entry.session.lock().await.as_ref() {
                return Ok(session.snapshot());
            }
        }
        Err(SessionError::NoSnapshot(id.to_string()))
    }

    /// 深拷贝最新快照为新 id 下的休眠会话，然后终止原会话
    pub async fn fork(&self, id: &str) -> Result<String, SessionError> {
        let snapshot = self.latest_snapshot(id).await?;
        let new_id = uuid::Uuid::new_v4().to_string();
        let control = self.new_control();
        let session = Session::restore(
            &snapshot,
            new_id.clone(),
            &self.config,
            self.collaborators.clone(),
            control.clone(),
        )?;
        if let Some(state) = snapshot.last_round_state() {
            control.publish_round_state(state);
        }
        control.publish_snapshot(snapshot);
        self.register(&new_id, vec![session]);
        self.terminate(id)?;
        tracing::info!(source = %id, fork = %new_id, "session forked");
        Ok(new_id)
    }

    /// 把最新快照写入 store
    pub async fn store(&self, id: &str, store: &SnapshotStore) -> Result<std::path::PathBuf, SessionError> {
        let snapshot = self.latest_snapshot(id).await?;
        store.save(id, &snapshot)
    }

    /// 从 store 读出快照并注册为同 id 的休眠会话
    pub fn load(&self, id: &str, store: &SnapshotStore) -> Result<Vec<SessionHandle>, SessionError> {
        let snapshot = store.load(id)?;
        let control = self.new_control();
        let session = Session::restore(
            &snapshot,
            id,
            &self.config,
            self.collaborators.clone(),
            control.clone(),
        )?;
        control.publish_snapshot(snapshot);
        Ok(self.register(id, vec![session]))
    }

    /// 请求投递给该 id 下第一个未结束的会话
    pub fn submit_request(&self, id: &str, request: &str) -> Result<(), SessionError> {
        self.target(id)?.control.submit_request(request);
        Ok(())
    }

    pub fn submit_confirmation(&self, id: &str, answer: Confirmation) -> Result<(), SessionError> {
        self.target(id)?.control.submit_confirmation(answer);
        Ok(())
    }

    pub fn status(&self, id: &str) -> Result<SessionStatus, SessionError> {
        Ok(self.target(id)?.control.status())
    }

    fn target(&self, id: &str) -> Result<Arc<ManagedSession>, SessionError> {
        let entries = self.entries(id)?;
        let finished = |e: &Arc<ManagedSession>| {
            e.control.is_cancelled()
                || matches!(
                    e.control.status(),
                    SessionStatus::Completed | SessionStatus::Error | SessionStatus::MaxStepReached
                )
        };
        entries
            .iter()
            .find(|e| !finished(*e))
            .or_else(|| entries.last())
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }
}
