//! 委托者：在选中的应用窗口内逐步决策并执行动作
//!
//! 决策为 CONFIRM 且开启 safe_guard 时，动作被暂存，下一次 handle 走 confirm 处理器等待用户确认：
//! 确认则执行并继续，拒绝（或会话被终止）则本轮结束且不触发任何执行。

use std::sync::Arc;

use async_trait::async_trait;

use crate::actuator::{Action, Actuator, ActuatorError, WindowRef};
use crate::agent::{log_decision, Agent, HandleEnv};
use crate::core::context::{Context, ContextKey};
use crate::core::snapshot::DelegateSnapshot;
use crate::core::state::{AgentRole, AgentState, AgentStatus, SessionStatus};
use crate::core::HandleError;
use crate::interaction::Confirmation;
use crate::llm::{PromptRequest, Prompter};
use crate::memory::{Memory, MemoryItem};

pub struct DelegateAgent {
    name: String,
    /// 应用窗口标题
    app_name: String,
    /// 应用可执行文件名
    root_name: String,
    prompter: Arc<dyn Prompter>,
    actuator: Arc<dyn Actuator>,
    memory: Memory,
    state: AgentState,
    status: AgentStatus,
    step: u64,
    window: Option<WindowRef>,
    pending_action: Option<Action>,
}

impl DelegateAgent {
    pub fn new(
        name: impl Into<String>,
        window: WindowRef,
        prompter: Arc<dyn Prompter>,
        actuator: Arc<dyn Actuator>,
        memory_limit: usize,
    ) -> Self {
        Self {
            name: name.into(),
            app_name: window.descriptor().title.clone(),
            root_name: window.descriptor().process_name.clone(),
            prompter,
            actuator,
            memory: Memory::new(memory_limit),
            state: AgentState::Continue,
            status: AgentStatus::Continue,
            step: 0,
            window: Some(window),
            pending_action: None,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn pending_action(&self) -> Option<&Action> {
        self.pending_action.as_ref()
    }

    /// 再次选中同一应用时更新窗口
    pub fn attach_window(&mut self, window: WindowRef) {
        self.app_name = window.descriptor().title.clone();
        self.root_name = window.descriptor().process_name.clone();
        self.window = Some(window);
    }

    pub async fn resolve_window(&mut self, actuator: &dyn Actuator) {
        if let Some(window) = self.window.as_mut() {
            if !window.resolve(actuator).await {
                tracing::warn!(delegate = %self.name, window = %window.title(), "window could not be resolved");
            }
        }
    }

    async fn execute(&mut self, action: &Action) -> Result<String, HandleError> {
        let window = self
            .window
            .as_ref()
            .ok_or_else(|| ActuatorError::WindowUnavailable(self.app_name.clone()))?;
        let result = self.actuator.execute(window, action).await?;
        tracing::info!(delegate = %self.name, action = %action.describe(), "action executed");
        self.memory.set_last_result(result.clone());
        Ok(result)
    }

    pub fn snapshot(&self) -> DelegateSnapshot {
        DelegateSnapshot {
            name: self.name.clone(),
            app_name: self.app_name.clone(),
            root_name: self.root_name.clone(),
            state: self.state,
            status: self.status.clone(),
            step: self.step,
            memory: self.memory.clone(),
            window: self.window.as_ref().map(|w| w.descriptor().clone()),
            pending_action: self.pending_action.clone(),
        }
    }

    pub fn restore(
        snapshot: &DelegateSnapshot,
        prompter: Arc<dyn Prompter>,
        actuator: Arc<dyn Actuator>,
    ) -> Self {
        Self {
            name: snapshot.name.clone(),
            app_name: snapshot.app_name.clone(),
            root_name: snapshot.root_name.clone(),
            prompter,
            actuator,
            memory: snapshot.memory.clone(),
            state: snapshot.state,
            status: snapshot.status.clone(),
            step: snapshot.step,
            window: snapshot.window.clone().map(WindowRef::unresolved),
            pending_action: snapshot.pending_action.clone(),
        }
    }
}

#[async_trait]
impl Agent for DelegateAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> AgentRole {
        AgentRole::Delegate
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
        let prompt = PromptRequest {
            role: AgentRole::Delegate,
            agent_name: self.name.clone(),
            request: ctx.text(ContextKey::Request).to_string(),
            history: self.memory.to_messages(),
            context_section: format!(
                "## Current Application\n{} ({})\n\n",
                self.app_name, self.root_name
            ),
            candidates: Vec::new(),
        };

        let decision = self.prompter.complete(&prompt).await?;
        ctx.record_step(decision.cost);
        self.step += 1;
        let status = decision.agent_status();
        self.status = status.clone();
        let action = decision.action();

        let mut item = MemoryItem::new(round, ctx.session_step(), status.as_str())
            .with_thought(decision.thought.clone())
            .with_comment(decision.comment.clone());
        if let Some(action) = &action {
            item = item.with_action(action.describe());
        }
        self.memory.add(item);
        log_decision(ctx, &self.name, &decision);
        tracing::info!(
            round,
            step = ctx.session_step(),
            agent = %self.name,
            status = status.as_str(),
            "delegate decision"
        );

        if status == AgentStatus::Confirm {
            if env.settings.safe_guard && action.is_some() {
                self.pending_action = action;
                return Ok(());
            }
            // 未开启确认或没有动作：按 CONTINUE 处理
            self.status = AgentStatus::Continue;
        }

        if let Some(action) = action {
            self.execute(&action).await?;
        }
        Ok(())
    }

    async fn confirm(&mut self, _ctx: &mut Context, env: &HandleEnv<'_>) -> Result<(), HandleError> {
        let Some(action) = self.pending_action.take() else {
            self.status = AgentStatus::Continue;
            return Ok(());
        };

        env.control.set_status(SessionStatus::Confirmation);
        tracing::info!(delegate = %self.name, action = %action.describe(), "awaiting user confirmation");
        let answer = env.input.await_confirmation(env.control.cancel_token()).await;
        env.control.set_status(SessionStatus::Running);

        match answer {
            Some(Confirmation::Yes) => {
                self.status = AgentStatus::Continue;
                self.execute(&action).await?;
            }
            _ => {
                tracing::info!(delegate = %self.name, "sensitive action declined");
                self.memory.set_last_result("Action declined by user");
                self.status = AgentStatus::Finish;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::DryRunActuator;
    use crate::config::SessionSection;
    use crate::core::supervisor::SessionControl;
    use crate::interaction::SlotInput;
    use crate::llm::{Decision, ScriptedPrompter};

    async fn notepad() -> (Arc<DryRunActuator>, WindowRef) {
        let actuator = Arc::new(DryRunActuator::new(&["Untitled - Notepad".to_string()]));
        let window = actuator.list_candidate_windows().await.unwrap().remove(0);
        (actuator, window)
    }

    #[tokio::test]
    async fn test_confirm_then_decline_never_executes() {
        let (actuator, window) = notepad().await;
        let prompter = Arc::new(ScriptedPrompter::new(vec![Decision::new("CONFIRM")
            .with_action("close_window", serde_json::json!({}))]));
        let mut delegate = DelegateAgent::new("Delegate/notepad.exe", window, prompter, actuator.clone(), 10);

        let mut ctx = Context::new();
        ctx.start_round(0);
        let control = SessionControl::default();
        let input = SlotInput::new();
        let settings = SessionSection::default();
        let env = HandleEnv {
            control: &control,
            input: &input,
            settings: &settings,
        };

        delegate.handle(&mut ctx, &env).await.unwrap();
        assert_eq!(delegate.status(), &AgentStatus::Confirm);
        assert!(delegate.pending_action().is_some());

        delegate.set_state(AgentState::Confirm);
        input.submit_confirmation(Confirmation::No);
        delegate.handle(&mut ctx, &env).await.unwrap();

        assert_eq!(delegate.status(), &AgentStatus::Finish);
        assert!(actuator.executed().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_accept_executes() {
        let (actuator, window) = notepad().await;
        let prompter = Arc::new(ScriptedPrompter::new(vec![Decision::new("CONFIRM")
            .with_action("close_window", serde_json::json!({}))]));
        let mut delegate = DelegateAgent::new("Delegate/notepad.exe", window, prompter, actuator.clone(), 10);

        let mut ctx = Context::new();
        ctx.start_round(0);
        let control = SessionControl::default();
        let input = SlotInput::new();
        let settings = SessionSection::default();
        let env = HandleEnv {
            control: &control,
            input: &input,
            settings: &settings,
        };

        delegate.handle(&mut ctx, &env).await.unwrap();
        delegate.set_state(AgentState::Confirm);
        input.submit_confirmation(Confirmation::Yes);
        delegate.handle(&mut ctx, &env).await.unwrap();

        assert_eq!(delegate.status(), &AgentStatus::Continue);
        assert_eq!(actuator.executed().len(), 1);
        // 确认不消耗决策步数
        assert_eq!(ctx.session_step(), 1);
    }

    #[tokio::test]
    async fn test_rejected_action_surfaces_error() {
        let actuator = Arc::new(
            DryRunActuator::new(&["Untitled - Notepad".to_string()]).reject_function("click_input"),
        );
        let window = actuator.list_candidate_windows().await.unwrap().remove(0);
        let prompter = Arc::new(ScriptedPrompter::new(vec![Decision::new("CONTINUE")
            .with_action("click_input", serde_json::json!({"button": "left"}))]));
        let mut delegate = DelegateAgent::new("Delegate/notepad.exe", window, prompter, actuator, 10);

        let mut ctx = Context::new();
        ctx.start_round(0);
        let control = SessionControl::default();
        let input = SlotInput::new();
        let settings = SessionSection::default();
        let env = HandleEnv {
            control: &control,
            input: &input,
            settings: &settings,
        };

        let err = delegate.handle(&mut ctx, &env).await.unwrap_err();
        assert!(matches!(err, HandleError::Actuation(ActuatorError::Rejected(_))));
    }
}
