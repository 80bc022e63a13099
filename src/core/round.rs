//! Round：一次用户请求的处理循环
//!
//! 每次循环头依次检查：终止 → 步数预算 → 暂停；然后让当前智能体 handle 一步，
//! 由状态机给出下一状态与下一个智能体，直到进入终止状态（FINISH / ERROR / MAX_STEP_REACHED）。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::agent::{CoordinatorAgent, EvaluationResult, Evaluator, HandleEnv};
use crate::config::SessionSection;
use crate::core::context::{Context, ContextKey};
use crate::core::recovery::RecoveryEngine;
use crate::core::snapshot::{RoundSnapshot, SnapshotPublisher};
use crate::core::state::{AgentRef, AgentState, AgentStatus};
use crate::core::supervisor::SessionControl;
use crate::core::{RecoveryAction, SessionError};
use crate::interaction::InputSource;

/// 连续未计步的失败达到该次数时按 ERROR 结束本轮；已计步的失败只受步数预算约束
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// 一轮的结局
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundOutcome {
    Finished,
    /// 以 ERROR 结束；带上该轮请求，便于调用方上报
    Error { request: String, message: String },
    MaxStepReached,
    Terminated,
}

/// Round 运行所需的会话资源（由 Session 借出）
pub struct RoundEnv<'a> {
    pub coordinator: &'a mut CoordinatorAgent,
    pub context: &'a mut Context,
    pub control: &'a SessionControl,
    pub input: &'a dyn InputSource,
    pub settings: &'a SessionSection,
    pub evaluator: Option<&'a dyn Evaluator>,
    pub recovery: &'a RecoveryEngine,
    pub publisher: &'a SnapshotPublisher,
}

#[derive(Debug, Clone)]
pub struct Round {
    id: u32,
    request: String,
    state: AgentState,
    agent: AgentRef,
    handles: u64,
    outcome: Option<RoundOutcome>,
    evaluation: Option<EvaluationResult>,
    last_error: Option<String>,
}

impl Round {
    /// 创建新一轮，并在 Context 中初始化该轮的步数 / 成本
    pub fn new(
        id: u32,
        request: impl Into<String>,
        agent: AgentRef,
        state: AgentState,
        context: &mut Context,
    ) -> Self {
        context.start_round(id);
        Self {
            id,
            request: request.into(),
            state,
            agent,
            handles: 0,
            outcome: None,
            evaluation: None,
            last_error: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn request(&self) -> &str {
        &self.request
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn agent(&self) -> &AgentRef {
        &self.agent
    }

    /// 本轮实际调用 handle 的次数
    pub fn handles(&self) -> u64 {
        self.handles
    }

    pub fn outcome(&self) -> Option<&RoundOutcome> {
        self.outcome.as_ref()
    }

    pub fn evaluation(&self) -> Option<&EvaluationResult> {
        self.evaluation.as_ref()
    }

    pub async fn run(&mut self, env: RoundEnv<'_>) -> Result<RoundOutcome, SessionError> {
        let RoundEnv {
            coordinator,
            context,
            control,
            input,
            settings,
            evaluator,
            recovery,
            publisher,
        } = env;

        context.start_round(self.id);
        context.set_text(ContextKey::Request, self.request.clone())?;
        let handle_env = HandleEnv {
            control,
            input,
            settings,
        };
        tracing::info!(round = self.id, request = %self.request, "round started");
        control.publish_round_state(self.state);

        let mut failures = 0u32;
        let outcome = loop {
            if control.is_cancelled() {
                coordinator.force_finish();
                self.state = AgentState::Finish;
                break RoundOutcome::Terminated;
            }
            if context.session_step() >= settings.max_step {
                self.state = AgentState::MaxStepReached;
                if let Some(agent) = coordinator.agent_mut(&self.agent) {
                    agent.set_state(self.state);
                }
                control.publish_round_state(self.state);
                tracing::warn!(round = self.id, max_step = settings.max_step, "step budget exhausted");
                break RoundOutcome::MaxStepReached;
            }
            if !control.wait_while_paused().await {
                continue;
            }

            let agent = coordinator
                .agent_mut(&self.agent)
                .ok_or_else(|| SessionError::UnknownAgent(format!("{:?}", self.agent)))?;
            let role = agent.role();
            let step_before = context.session_step();
            let result = agent.handle(context, &handle_env).await;
            self.handles += 1;

            if let Err(err) = result {
                let (round, step) = (context.current_round_id(), context.session_step());
                if step > step_before {
                    failures = 0;
                } else {
                    failures += 1;
                }
                let action = match recovery.handle(&err) {
                    RecoveryAction::RetryWithPrompt(_) if failures >= MAX_CONSECUTIVE_FAILURES => {
                        RecoveryAction::Abort(format!("giving up after {} failures: {}", failures, err))
                    }
                    action => action,
                };
                match action {
                    RecoveryAction::RetryWithPrompt(hint) => {
                        tracing::warn!(round, step, agent = %agent.name(), error = %err, "step failed, retrying");
                        agent.record_failure(round, step, &format!("{}. {}", err, hint));
                        agent.set_status(AgentStatus::Continue);
                    }
                    RecoveryAction::Abort(message) => {
                        tracing::error!(round, step, agent = %agent.name(), error = %err, "step failed, aborting round");
                        self.last_error = Some(message);
                        agent.set_status(AgentStatus::Error);
                    }
                }
            } else {
                failures = 0;
            }

            let next = AgentState::next_state(role, agent.status());
            agent.set_state(next);
            let next_agent = next.next_agent(&self.agent, coordinator.active_name());
            if next_agent != self.agent {
                if let Some(agent) = coordinator.agent_mut(&next_agent) {
                    agent.set_state(next);
                }
                tracing::debug!(round = self.id, from = ?self.agent, to = ?next_agent, "control switched");
            }
            self.agent = next_agent;
            self.state = next;
            control.publish_round_state(next);

            if next.is_round_end() {
                let outcome = match next {
                    AgentState::Finish => RoundOutcome::Finished,
                    AgentState::MaxStepReached => RoundOutcome::MaxStepReached,
                    _ => RoundOutcome::Error {
                        request: self.request.clone(),
                        message: self
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "agent reported ERROR".to_string()),
                    },
                };
                self.outcome = Some(outcome.clone());
                publisher.publish(control, self.snapshot(), context, coordinator);
                break outcome;
            }
            publisher.publish(control, self.snapshot(), context, coordinator);
        };

        self.outcome = Some(outcome.clone());
        publisher.publish(control, self.snapshot(), context, coordinator);

        if settings.eva_round && outcome != RoundOutcome::Terminated {
            if let Some(evaluator) = evaluator {
                let log_path = PathBuf::from(context.text(ContextKey::LogPath));
                match evaluator
                    .evaluate(std::slice::from_ref(&self.request), &log_path)
                    .await
                {
                    Ok((result, cost)) => {
                        context.add_cost(cost);
                        if let Some(logs) = context.logs() {
                            let mut entry = serde_json::to_value(&result).unwrap_or_default();
                            entry["level"] = "round".into();
                            entry["round"] = self.id.into();
                            entry["request"] = self.request.clone().into();
                            entry["cost"] = cost.into();
                            logs.log_evaluation(entry);
                        }
                        self.evaluation = Some(result);
                    }
                    Err(e) => tracing::warn!(round = self.id, error = %e, "round evaluation failed"),
                }
            }
        }

        tracing::info!(
            round = self.id,
            outcome = ?outcome,
            steps = context.round_step(self.id),
            cost = context.round_cost(self.id),
            "round finished"
        );
        Ok(outcome)
    }

    pub fn snapshot(&self) -> RoundSnapshot {
        RoundSnapshot {
            id: self.id,
            request: self.request.clone(),
            state: self.state,
            agent: self.agent.clone(),
            handles: self.handles,
            outcome: self.outcome.clone(),
            evaluation: self.evaluation.clone(),
        }
    }

    pub fn restore(snapshot: &RoundSnapshot) -> Self {
        Self {
            id: snapshot.id,
            request: snapshot.request.clone(),
            state: snapshot.state,
            agent: snapshot.agent.clone(),
            handles: snapshot.handles,
            outcome: snapshot.outcome.clone(),
            evaluation: snapshot.evaluation.clone(),
            last_error: None,
        }
    }
}
