//! 协调者：在桌面窗口中选择应用，并把控制交给该应用的委托者
//!
//! 委托者按可执行文件名注册（`Delegate/<process_name>`），首次选中时创建，之后各轮复用。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::actuator::{Actuator, WindowRef};
use crate::agent::{log_decision, Agent, Collaborators, DelegateAgent, HandleEnv};
use crate::core::context::{Context, ContextKey};
use crate::core::snapshot::CoordinatorSnapshot;
use crate::core::state::{AgentRef, AgentRole, AgentState, AgentStatus, SessionStatus};
use crate::core::HandleError;
use crate::llm::{PromptRequest, Prompter};
use crate::memory::{Blackboard, Memory, MemoryItem};

pub const COORDINATOR_NAME: &str = "Coordinator";

pub struct CoordinatorAgent {
    name: String,
    prompter: Arc<dyn Prompter>,
    delegate_prompter: Arc<dyn Prompter>,
    actuator: Arc<dyn Actuator>,
    memory: Memory,
    blackboard: Blackboard,
    state: AgentState,
    status: AgentStatus,
    step: u64,
    delegates: BTreeMap<String, DelegateAgent>,
    active: Option<String>,
    memory_limit: usize,
}

impl CoordinatorAgent {
    pub fn new(collaborators: &Collaborators, memory_limit: usize) -> Self {
        Self {
            name: COORDINATOR_NAME.to_string(),
            prompter: collaborators.coordinator_prompter.clone(),
            delegate_prompter: collaborators.delegate_prompter.clone(),
            actuator: collaborators.actuator.clone(),
            memory: Memory::new(memory_limit),
            blackboard: Blackboard::new(),
            state: AgentState::Continue,
            status: AgentStatus::Continue,
            step: 0,
            delegates: BTreeMap::new(),
            active: None,
            memory_limit,
        }
    }

    pub fn blackboard(&self) -> &Blackboard {
        &self.blackboard
    }

    pub fn blackboard_mut(&mut self) -> &mut Blackboard {
        &mut self.blackboard
    }

    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_delegate_mut(&mut self) -> Option<&mut DelegateAgent> {
        let name = self.active.as_ref()?;
        self.delegates.get_mut(name)
    }

    pub fn delegate(&self, name: &str) -> Option<&DelegateAgent> {
        self.delegates.get(name)
    }

    pub fn delegate_count(&self) -> usize {
        self.delegates.len()
    }

    /// 按引用取出智能体（Round 通过它驱动协调者或委托者）
    pub fn agent_mut(&mut self, agent: &AgentRef) -> Option<&mut dyn Agent> {
        match agent {
            AgentRef::Coordinator => Some(self as &mut dyn Agent),
            AgentRef::Delegate(name) => self
                .delegates
                .get_mut(name)
                .map(|d| d as &mut dyn Agent),
        }
    }

    /// 新请求开始前：回到 CONTINUE
    pub fn reset_for_request(&mut self) {
        self.state = AgentState::Continue;
        self.status = AgentStatus::Continue;
    }

    /// terminate 后强制结束
    pub fn force_finish(&mut self) {
        self.state = AgentState::Finish;
        self.status = AgentStatus::Finish;
    }

    /// 精确匹配标题或进程名优先，其次标题大小写不敏感包含
    fn match_window(candidates: &[WindowRef], target: &str) -> Option<WindowRef> {
        let exact = candidates.iter().find(|w| {
            let d = w.descriptor();
            d.title == target || d.process_name == target
        });
        if let Some(window) = exact {
            return Some(window.clone());
        }
        let needle = target.to_lowercase();
        candidates
            .iter()
            .find(|w| w.title().to_lowercase().contains(&needle))
            .cloned()
    }

    fn get_or_create_delegate(&mut self, window: &WindowRef) -> String {
        let key = format!("Delegate/{}", window.descriptor().process_name);
        let prompter = self.delegate_prompter.clone();
        let actuator = self.actuator.clone();
        let limit = self.memory_limit;
        self.delegates
            .entry(key.clone())
            .and_modify(|d| d.attach_window(window.clone()))
            .or_insert_with(|| {
                tracing::info!(delegate = %key, "creating delegate agent");
                DelegateAgent::new(key.clone(), window.clone(), prompter, actuator, limit)
            });
        key
    }

    async fn select_application(&mut self, ctx: &mut Context, window: WindowRef) {
        let previous = ctx.window().cloned();
        if let Some(previous) = previous {
            if previous.descriptor() != window.descriptor() && previous.is_alive() {
                if let Err(e) = self.actuator.minimize(&previous).await {
                    tracing::warn!(window = %previous.title(), error = %e, "failed to minimize previous window");
                }
            }
        }
        ctx.set_application(window.clone());
        let name = self.get_or_create_delegate(&window);
        self.blackboard
            .add_trajectory(format!("Selected application: {}", window.title()));
        tracing::info!(application = %window.title(), delegate = %name, "application selected");
        self.active = Some(name);
    }

    /// 快照恢复后重新绑定各委托者的窗口
    pub async fn resolve_windows(&mut self, actuator: &dyn Actuator) {
        for delegate in self.delegates.values_mut() {
            delegate.resolve_window(actuator).await;
        }
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            name: self.name.clone(),
            state: self.state,
            status: self.status.clone(),
            step: self.step,
            memory: self.memory.clone(),
            blackboard: self.blackboard.clone(),
            delegates: self.delegates.values().map(|d| d.snapshot()).collect(),
            active: self.active.clone(),
        }
    }

    pub fn restore(
        snapshot: &CoordinatorSnapshot,
        collaborators: &Collaborators,
        memory_limit: usize,
    ) -> Self {
        let mut agent = Self::new(collaborators, memory_limit);
        agent.name = snapshot.name.clone();
        agent.state = snapshot.state;
        agent.status = snapshot.status.clone();
        agent.step = snapshot.step;
        agent.memory = snapshot.memory.clone();
        agent.blackboard = snapshot.blackboard.clone();
        agent.delegates = snapshot
            .delegates
            .iter()
            .map(|d| {
                (
                    d.name.clone(),
                    DelegateAgent::restore(
                        d,
                        collaborators.delegate_prompter.clone(),
                        collaborators.actuator.clone(),
                    ),
                )
            })
            .collect();
        agent.active = snapshot
            .active
            .clone()
            .filter(|name| agent.delegates.contains_key(name));
        agent
    }
}

#[async_trait]
impl Agent for CoordinatorAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Coordinator
    }

    fn state(&self) -> AgentState {
        self.state
    }

    fn set_state(&mut self, state: AgentState) {
        self.state = state;
    }

    fn status(&self) -> &AgentStatus {
        &self.status
    }

    fn set_status(&mut self, status: AgentStatus) {
        self.status = status;
    }

    fn memory(&self) -> &Memory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    async fn process(&mut self, ctx: &mut Context, env: &HandleEnv<'_>) -> Result<(), HandleError> {
        let round = ctx.current_round_id();
        let candidates = self.actuator.list_candidate_windows().await?;
        let prompt = PromptRequest {
            role: AgentRole::Coordinator,
            agent_name: self.name.clone(),
            request: ctx.text(ContextKey::Request).to_string(),
            history: self.memory.to_messages(),
            context_section: self.blackboard.to_prompt_section(),
            candidates: candidates.iter().map(|w| w.descriptor().clone()).collect(),
        };

        let decision = self.prompter.complete(&prompt).await?;
        ctx.record_step(decision.cost);
        self.step += 1;
        let status = decision.agent_status();
        self.status = status.clone();

        let mut item = MemoryItem::new(round, ctx.session_step(), status.as_str())
            .with_thought(decision.thought.clone())
            .with_comment(decision.comment.clone());
        if let Some(target) = &decision.target {
            item = item.with_action(format!("select_application({})", target));
        }
        self.memory.add(item);
        log_decision(ctx, &self.name, &decision);
        tracing::info!(
            round,
            step = ctx.session_step(),
            agent = %self.name,
            status = status.as_str(),
            "coordinator decision"
        );

        if !matches!(status, AgentStatus::Switch | AgentStatus::Finish) {
            return Ok(());
        }
        let target = decision
            .target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty());
        let target = match (target, &status) {
            (Some(target), _) => target,
            (None, AgentStatus::Switch) => {
                return Err(HandleError::ApplicationNotFound("<none>".to_string()))
            }
            (None, _) => return Ok(()),
        };
        let window = Self::match_window(&candidates, target)
            .ok_or_else(|| HandleError::ApplicationNotFound(target.to_string()))?;

        if env.control.selection_locked() {
            env.control.set_status(SessionStatus::Confirmation);
            tracing::info!(application = %window.title(), "waiting for application selection unlock");
            let unlocked = env.control.wait_selection_unlock().await;
            env.control.set_status(SessionStatus::Running);
            if !unlocked {
                self.force_finish();
                return Ok(());
            }
        }

        self.select_application(ctx, window).await;
        Ok(())
    }
}
