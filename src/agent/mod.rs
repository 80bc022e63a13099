//! 智能体：协调者（选择应用）、委托者（应用内动作）、评估者
//!
//! 每次 handle 按当前状态查处理表：普通状态走 process（一次决策），委托者的 CONFIRM 走 confirm（等待用户确认）。
//! 处理结果写回智能体自身的 status，由 Round 通过状态机决定下一状态与下一个智能体。

pub mod coordinator;
pub mod delegate;
pub mod evaluator;

use std::sync::Arc;

use async_trait::async_trait;

use crate::actuator::Actuator;
use crate::config::SessionSection;
use crate::core::context::{Context, ContextKey};
use crate::core::state::{AgentRole, AgentState, AgentStatus, StepHandler};
use crate::core::supervisor::SessionControl;
use crate::core::HandleError;
use crate::experience::ExperienceStore;
use crate::interaction::InputSource;
use crate::llm::{Decision, Prompter};
use crate::memory::{Memory, MemoryItem};

pub use coordinator::CoordinatorAgent;
pub use delegate::DelegateAgent;
pub use evaluator::{EvaluationError, EvaluationResult, Evaluator, LlmEvaluator};

/// 会话运行所需的外部协作者（可在多个会话间共享）
#[derive(Clone)]
pub struct Collaborators {
    pub coordinator_prompter: Arc<dyn Prompter>,
    pub delegate_prompter: Arc<dyn Prompter>,
    pub actuator: Arc<dyn Actuator>,
    pub evaluator: Option<Arc<dyn Evaluator>>,
    pub experience: Option<Arc<dyn ExperienceStore>>,
    /// 为 None 时会话使用自身控制面的输入单槽
    pub input: Option<Arc<dyn InputSource>>,
}

impl Collaborators {
    pub fn new(
        coordinator_prompter: Arc<dyn Prompter>,
        delegate_prompter: Arc<dyn Prompter>,
        actuator: Arc<dyn Actuator>,
    ) -> Self {
        Self {
            coordinator_prompter,
            delegate_prompter,
            actuator,
            evaluator: None,
            experience: None,
            input: None,
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn with_experience(mut self, store: Arc<dyn ExperienceStore>) -> Self {
        self.experience = Some(store);
        self
    }

    pub fn with_input(mut self, input: Arc<dyn InputSource>) -> Self {
        self.input = Some(input);
        self
    }
}

/// 单步处理时可用的会话环境
pub struct HandleEnv<'a> {
    pub control: &'a SessionControl,
    pub input: &'a dyn InputSource,
    pub settings: &'a SessionSection,
}

#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    fn role(&self) -> AgentRole;

    fn state(&self) -> AgentState;

    fn set_state(&mut self, state: AgentState);

    fn status(&self) -> &AgentStatus;

    fn set_status(&mut self, status: AgentStatus);

    fn memory(&self) -> &Memory;

    fn memory_mut(&mut self) -> &mut Memory;

    /// 一次决策（调用 Prompter 并执行结果）
    async fn process(&mut self, ctx: &mut Context, env: &HandleEnv<'_>) -> Result<(), HandleError>;

    /// 等待敏感操作确认；只有委托者需要
    async fn confirm(&mut self, _ctx: &mut Context, _env: &HandleEnv<'_>) -> Result<(), HandleError> {
        Ok(())
    }

    /// 按当前状态分派；终止状态不做任何事
    async fn handle(&mut self, ctx: &mut Context, env: &HandleEnv<'_>) -> Result<(), HandleError> {
        match self.state().handler(self.role()) {
            Some(StepHandler::Process) => self.process(ctx, env).await,
            Some(StepHandler::Confirm) => self.confirm(ctx, env).await,
            None => Ok(()),
        }
    }

    fn record_failure(&mut self, round: u32, step: u64, reason: &str) {
        self.memory_mut()
            .add(MemoryItem::failure(round, step, reason));
    }
}

/// 每步决策写入 response.log
pub(crate) fn log_decision(ctx: &Context, agent: &str, decision: &Decision) {
    let Some(logs) = ctx.logs() else {
        return;
    };
    logs.log_response(serde_json::json!({
        "Round": ctx.current_round_id(),
        "RoundStep": ctx.current_round_step(),
        "Step": ctx.session_step(),
        "Agent": agent,
        "Request": ctx.text(ContextKey::Request),
        "Application": ctx.text(ContextKey::ApplicationProcessName),
        "Status": decision.status,
        "Target": decision.target,
        "Function": decision.function,
        "Args": decision.args,
        "Thought": decision.thought,
        "Plan": decision.plan,
        "Comment": decision.comment,
        "Cost": decision.cost,
    }));
}
