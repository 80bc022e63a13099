//! Session：一串 Round + 共享 Context
//!
//! 普通模式从输入源逐条读取请求（首条之后输入 "N" 结束）；跟随模式按计划文件回放。
//! 会话结束后可选做会话级评估与经验保存，最终状态写回 SessionControl。

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::actuator::Actuator;
use crate::agent::{Agent, Collaborators, CoordinatorAgent, EvaluationResult};
use crate::config::{AppConfig, SessionSection};
use crate::core::context::{Context, ContextKey, ContextValue};
use crate::core::plan::PlanReader;
use crate::core::recovery::RecoveryEngine;
use crate::core::round::{Round, RoundEnv, RoundOutcome};
use crate::core::snapshot::{SessionSnapshot, SnapshotPublisher};
use crate::core::state::{AgentRef, AgentState, AgentStatus, SessionStatus};
use crate::core::supervisor::SessionControl;
use crate::core::SessionError;
use crate::interaction::{Confirmation, InputSource};
use crate::observability::SessionLogs;

/// 会话结束时的窗口快照文件名
pub const FINAL_SNAPSHOT: &str = "action_step_final.png";

/// 请求来源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionMode {
    Normal,
    Follower(PlanReader),
}

impl SessionMode {
    pub fn name(&self) -> &'static str {
        match self {
            SessionMode::Normal => "normal",
            SessionMode::Follower(_) => "follower",
        }
    }
}

/// run() 的最终结果
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub status: SessionStatus,
    pub rounds: usize,
    pub steps: u64,
    pub cost: f64,
    pub evaluation: Option<EvaluationResult>,
}

pub struct Session {
    id: String,
    task: String,
    mode: SessionMode,
    finished: bool,
    rounds: BTreeMap<u32, Round>,
    /// 快照恢复时尚未结束的轮次，run() 时先续跑
    pending: Option<Round>,
    context: Context,
    coordinator: CoordinatorAgent,
    control: Arc<SessionControl>,
    input: Arc<dyn InputSource>,
    collaborators: Collaborators,
    settings: SessionSection,
    log_path: PathBuf,
    recovery: RecoveryEngine,
    evaluation: Option<EvaluationResult>,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        task: impl Into<String>,
        mode: SessionMode,
        config: &AppConfig,
        collaborators: Collaborators,
        control: Arc<SessionControl>,
    ) -> Result<Self, SessionError> {
        let id = id.into();
        let task = task.into();
        let log_path = config.app.log_root.join(&task);

        let mut context = Context::new();
        context.set_text(ContextKey::Id, id.clone())?;
        context.set_text(ContextKey::Mode, mode.name())?;
        context.set_text(ContextKey::LogPath, log_path.display().to_string())?;
        let logs = SessionLogs::create(&log_path)?;
        context.set(ContextKey::Logger, ContextValue::Logger(Some(Arc::new(logs))))?;

        let coordinator = CoordinatorAgent::new(&collaborators, config.session.memory_limit);
        let input = collaborators
            .input
            .clone()
            .unwrap_or_else(|| control.input() as Arc<dyn InputSource>);

        tracing::info!(session_id = %id, task = %task, mode = mode.name(), "session created");
        Ok(Self {
            id,
            task,
            mode,
            finished: false,
            rounds: BTreeMap::new(),
            pending: None,
            context,
            coordinator,
            control,
            input,
            collaborators,
            settings: config.session.clone(),
            log_path,
            recovery: RecoveryEngine::new(),
            evaluation: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn mode(&self) -> &SessionMode {
        &self.mode
    }

    pub fn control(&self) -> &Arc<SessionControl> {
        &self.control
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn coordinator(&self) -> &CoordinatorAgent {
        &self.coordinator
    }

    pub fn rounds(&self) -> &BTreeMap<u32, Round> {
        &self.rounds
    }

    pub fn evaluation(&self) -> Option<&EvaluationResult> {
        self.evaluation.as_ref()
    }

    /// 完成标志或步数预算耗尽
    pub fn is_finished(&self) -> bool {
        self.finished || self.context.session_step() >= self.settings.max_step
    }

    pub fn next_round_id(&self) -> u32 {
        let last = self
            .rounds
            .keys()
            .next_back()
            .copied()
            .max(self.pending.as_ref().map(|r| r.id()));
        last.map_or(0, |id| id + 1)
    }

    pub async fn run(&mut self) -> Result<SessionOutcome, SessionError> {
        if let Err(e) = self.run_rounds().await {
            tracing::error!(session_id = %self.id, error = %e, "session aborted");
            self.finished = true;
            self.control.set_status(SessionStatus::Error);
            self.control.clear_round_state();
            self.publish_snapshot();
            return Err(e);
        }

        let cancelled = self.control.is_cancelled();
        self.capture_final_snapshot().await;

        if self.settings.eva_session && !cancelled {
            self.evaluate_session().await;
        }
        if matches!(self.mode, SessionMode::Normal) && self.settings.ask_experience && !cancelled {
            self.save_experience().await;
        }

        let status = match self.rounds.values().next_back().and_then(|r| r.outcome()) {
            Some(RoundOutcome::MaxStepReached) => SessionStatus::MaxStepReached,
            Some(RoundOutcome::Error { .. }) => SessionStatus::Error,
            _ => SessionStatus::Completed,
        };
        self.finished = true;
        self.publish_snapshot();
        self.control.set_status(status);
        self.control.clear_round_state();

        let outcome = SessionOutcome {
            status,
            rounds: self.rounds.len(),
            steps: self.context.session_step(),
            cost: self.context.session_cost(),
            evaluation: self.evaluation.clone(),
        };
        tracing::info!(
            session_id = %self.id,
            status = status.name(),
            rounds = outcome.rounds,
            steps = outcome.steps,
            cost = outcome.cost,
            "session finished"
        );
        Ok(outcome)
    }

    async fn run_rounds(&mut self) -> Result<(), SessionError> {
        if let Some(round) = self.pending.take() {
            tracing::info!(session_id = %self.id, round = round.id(), "resuming unfinished round");
            self.run_round(round).await?;
        }

        while !self.is_finished() && !self.control.is_cancelled() {
            let Some(round) = self.create_new_round().await? else {
                break;
            };
            self.run_round(round).await?;
        }
        Ok(())
    }

    /// 取下一条请求并构建 Round；没有更多请求时返回 None 并置完成标志
    pub async fn create_new_round(&mut self) -> Result<Option<Round>, SessionError> {
        self.publish_snapshot();
        let (request, agent) = match &mut self.mode {
            SessionMode::Normal => {
                self.control.set_status(SessionStatus::WaitingRequest);
                // 首条请求没有退出信号：空行继续等待，"N" 按普通请求处理
                let first = self.rounds.is_empty();
                let request = loop {
                    let request = self
                        .input
                        .await_request(self.control.cancel_token())
                        .await
                        .map(|r| r.trim().to_string());
                    match request {
                        Some(r) if first && r.is_empty() => continue,
                        other => break other,
                    }
                };
                match request {
                    Some(request) if first || (!request.is_empty() && !request.eq_ignore_ascii_case("N")) => {
                        self.coordinator.reset_for_request();
                        (request, AgentRef::Coordinator)
                    }
                    _ => {
                        tracing::info!(session_id = %self.id, "no further request, finishing session");
                        self.finished = true;
                        return Ok(None);
                    }
                }
            }
            SessionMode::Follower(plan) => {
                let host = plan.host_pending();
                let Some(request) = plan.next_request() else {
                    self.finished = true;
                    return Ok(None);
                };
                let agent = if host {
                    self.coordinator.reset_for_request();
                    AgentRef::Coordinator
                } else {
                    match self.coordinator.active_delegate_mut() {
                        Some(delegate) => {
                            delegate.memory_mut().clear();
                            delegate.set_state(AgentState::Continue);
                            delegate.set_status(AgentStatus::Continue);
                            AgentRef::Delegate(delegate.name().to_string())
                        }
                        None => {
                            tracing::warn!(session_id = %self.id, "no active delegate, plan step goes to the coordinator");
                            self.coordinator.reset_for_request();
                            AgentRef::Coordinator
                        }
                    }
                };
                if !host {
                    self.coordinator.blackboard_mut().clear_requests();
                }
                (request, agent)
            }
        };

        let state = self
            .coordinator
            .agent_mut(&agent)
            .map(|a| a.state())
            .unwrap_or(AgentState::Continue);
        let id = self.next_round_id();
        self.coordinator.blackboard_mut().add_request(request.clone());
        self.context.set_text(ContextKey::Request, request.clone())?;
        if let Some(logs) = self.context.logs() {
            logs.log_request(serde_json::json!({
                "Round": id,
                "Request": request,
                "Agent": format!("{:?}", agent),
            }));
        }
        Ok(Some(Round::new(id, request, agent, state, &mut self.context)))
    }

    async fn run_round(&mut self, mut round: Round) -> Result<(), SessionError> {
        self.control.set_status(SessionStatus::Running);
        let publisher = self.publisher();
        let evaluator = self.collaborators.evaluator.clone();
        let env = RoundEnv {
            coordinator: &mut self.coordinator,
            context: &mut self.context,
            control: &*self.control,
            input: &*self.input,
            settings: &self.settings,
            evaluator: evaluator.as_deref(),
            recovery: &self.recovery,
            publisher: &publisher,
        };
        let outcome = round.run(env).await?;
        if outcome != RoundOutcome::Terminated {
            self.control.set_status(SessionStatus::RoundFinished);
        }
        if let RoundOutcome::Error { request, message } = &outcome {
            tracing::error!(session_id = %self.id, request = %request, error = %message, "round ended in error");
        }
        self.rounds.insert(round.id(), round);
        Ok(())
    }

    async fn capture_final_snapshot(&self) {
        let Some(window) = self.context.window() else {
            return;
        };
        if !window.is_resolved() || !window.is_alive() {
            return;
        }
        let path = self.log_path.join(FINAL_SNAPSHOT);
        if let Err(e) = self.collaborators.actuator.capture_snapshot(window, &path).await {
            tracing::warn!(session_id = %self.id, error = %e, "failed to capture final snapshot");
        }
    }

    async fn evaluate_session(&mut self) {
        let Some(evaluator) = self.collaborators.evaluator.clone() else {
            return;
        };
        self.control.set_status(SessionStatus::Evaluating);
        let requests = match &self.mode {
            SessionMode::Normal => self.coordinator.blackboard().requests().to_vec(),
            SessionMode::Follower(plan) => vec![plan.task.clone()],
        };
        match evaluator.evaluate(&requests, &self.log_path).await {
            Ok((result, cost)) => {
                self.context.add_cost(cost);
                if let Some(logs) = self.context.logs() {
                    let mut entry = serde_json::to_value(&result).unwrap_or_default();
                    entry["level"] = "session".into();
                    entry["requests"] = requests.into();
                    entry["cost"] = cost.into();
                    logs.log_evaluation(entry);
                }
                tracing::info!(session_id = %self.id, complete = %result.complete, "session evaluated");
                self.evaluation = Some(result);
            }
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "session evaluation failed"),
        }
    }

    async fn save_experience(&mut self) {
        let Some(store) = self.collaborators.experience.clone() else {
            return;
        };
        self.control.set_status(SessionStatus::SaveExp);
        tracing::info!(session_id = %self.id, "asking whether to save experience");
        let answer = self
            .input
            .await_confirmation(self.control.cancel_token())
            .await;
        if answer != Some(Confirmation::Yes) {
            return;
        }
        match store.summarize(&self.log_path).await {
            Ok((summaries, cost)) => {
                self.context.add_cost(cost);
                if let Err(e) = store.persist(&summaries).await {
                    tracing::warn!(session_id = %self.id, error = %e, "failed to persist experience");
                }
            }
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "failed to summarize experience"),
        }
    }

    fn publisher(&self) -> SnapshotPublisher {
        SnapshotPublisher {
            id: self.id.clone(),
            task: self.task.clone(),
            mode: self.mode.clone(),
            finished: self.finished,
            history: self.rounds.values().map(|r| r.snapshot()).collect(),
        }
    }

    fn publish_snapshot(&self) {
        self.control.publish_snapshot(self.snapshot());
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.publisher().build(
            self.pending.as_ref().map(|r| r.snapshot()),
            &self.context,
            &self.coordinator,
        )
    }

    /// 从快照重建会话：窗口未解析，日志句柄重新打开；未结束的轮次在 run() 时续跑
    pub fn restore(
        snapshot: &SessionSnapshot,
        id: impl Into<String>,
        config: &AppConfig,
        collaborators: Collaborators,
        control: Arc<SessionControl>,
    ) -> Result<Self, SessionError> {
        let id = id.into();
        let mut context = Context::restore(&snapshot.context);
        context.set_text(ContextKey::Id, id.clone())?;
        let log_path = if snapshot.context.log_path.is_empty() {
            config.app.log_root.join(&snapshot.task)
        } else {
            PathBuf::from(&snapshot.context.log_path)
        };
        context.set_text(ContextKey::LogPath, log_path.display().to_string())?;
        let logs = SessionLogs::create(&log_path)?;
        context.set(ContextKey::Logger, ContextValue::Logger(Some(Arc::new(logs))))?;

        let mut rounds = BTreeMap::new();
        let mut pending = None;
        for round in &snapshot.rounds {
            let round = Round::restore(round);
            if round.outcome().is_some() {
                rounds.insert(round.id(), round);
            } else {
                pending = Some(round);
            }
        }

        let coordinator = CoordinatorAgent::restore(
            &snapshot.coordinator,
            &collaborators,
            config.session.memory_limit,
        );
        let input = collaborators
            .input
            .clone()
            .unwrap_or_else(|| control.input() as Arc<dyn InputSource>);

        tracing::info!(session_id = %id, source = %snapshot.id, task = %snapshot.task, "session restored from snapshot");
        Ok(Self {
            id,
            task: snapshot.task.clone(),
            mode: snapshot.mode.clone(),
            finished: snapshot.finished,
            rounds,
            pending,
            context,
            coordinator,
            control,
            input,
            collaborators,
            settings: config.session.clone(),
            log_path,
            recovery: RecoveryEngine::new(),
            evaluation: None,
        })
    }

    /// 恢复后重新绑定当前应用窗口与各委托者窗口
    pub async fn resolve_windows(&mut self, actuator: &dyn Actuator) {
        if let Some(window) = self.context.window_mut() {
            if !window.is_resolved() && !window.resolve(actuator).await {
                tracing::warn!(window = %window.title(), "application window could not be resolved");
            }
        }
        self.coordinator.resolve_windows(actuator).await;
    }
}
