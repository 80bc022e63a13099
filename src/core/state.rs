//! 智能体状态机：状态、决策状态、转移表与会话状态投影
//!
//! 转移是 (角色, 决策状态) 上的全函数；Round 只依赖这里的 next_state / next_agent / handler，不做额外分支。

use serde::{Deserialize, Serialize};

/// 智能体角色：协调者选择应用，委托者在应用内执行动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRole {
    Coordinator,
    Delegate,
}

/// 当前 Round 中由哪个智能体行动
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRef {
    Coordinator,
    /// 委托者注册名（如 `Delegate/notepad.exe`）
    Delegate(String),
}

impl AgentRef {
    pub fn role(&self) -> AgentRole {
        match self {
            AgentRef::Coordinator => AgentRole::Coordinator,
            AgentRef::Delegate(_) => AgentRole::Delegate,
        }
    }
}

/// LLM 决策中的 Status 字段（解析后）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgentStatus {
    Continue,
    Switch,
    Confirm,
    Finish,
    Error,
    Fail,
    Unknown(String),
}

impl AgentStatus {
    /// 大小写不敏感；凡包含 FINISH 的状态（如 "FINISH." / "ALLFINISH"）均视为 Finish
    pub fn parse(raw: &str) -> Self {
        let upper = raw.trim().to_uppercase();
        match upper.as_str() {
            "CONTINUE" => AgentStatus::Continue,
            "SWITCH" => AgentStatus::Switch,
            "CONFIRM" | "PENDING" => AgentStatus::Confirm,
            "ERROR" => AgentStatus::Error,
            "FAIL" => AgentStatus::Fail,
            s if s.contains("FINISH") => AgentStatus::Finish,
            _ => AgentStatus::Unknown(raw.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AgentStatus::Continue => "CONTINUE",
            AgentStatus::Switch => "SWITCH",
            AgentStatus::Confirm => "CONFIRM",
            AgentStatus::Finish => "FINISH",
            AgentStatus::Error => "ERROR",
            AgentStatus::Fail => "FAIL",
            AgentStatus::Unknown(s) => s.as_str(),
        }
    }
}

/// 单步处理方式：正常决策，或等待敏感操作确认
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepHandler {
    Process,
    Confirm,
}

/// 智能体状态（Round 级终止状态为 Finish / Error / MaxStepReached）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentState {
    Continue,
    Switch,
    Confirm,
    Finish,
    Error,
    /// 预算守卫，不由智能体输出产生
    MaxStepReached,
}

impl AgentState {
    pub const ALL: [AgentState; 6] = [
        AgentState::Continue,
        AgentState::Switch,
        AgentState::Confirm,
        AgentState::Finish,
        AgentState::Error,
        AgentState::MaxStepReached,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AgentState::Continue => "CONTINUE",
            AgentState::Switch => "SWITCH",
            AgentState::Confirm => "CONFIRM",
            AgentState::Finish => "FINISH",
            AgentState::Error => "ERROR",
            AgentState::MaxStepReached => "MAX_STEP_REACHED",
        }
    }

    pub fn is_round_end(&self) -> bool {
        matches!(
            self,
            AgentState::Finish | AgentState::Error | AgentState::MaxStepReached
        )
    }

    /// 由角色与决策状态计算下一状态
    ///
    /// 协调者没有待确认动作，其 CONFIRM 视为 CONTINUE。
    pub fn next_state(role: AgentRole, status: &AgentStatus) -> AgentState {
        match (role, status) {
            (_, AgentStatus::Continue) => AgentState::Continue,
            (_, AgentStatus::Switch) => AgentState::Switch,
            (AgentRole::Coordinator, AgentStatus::Confirm) => AgentState::Continue,
            (AgentRole::Delegate, AgentStatus::Confirm) => AgentState::Confirm,
            (_, AgentStatus::Finish) => AgentState::Finish,
            (_, AgentStatus::Error | AgentStatus::Fail | AgentStatus::Unknown(_)) => {
                AgentState::Error
            }
        }
    }

    /// 下一个行动的智能体：Switch 在协调者与（选中的）委托者之间换手，其余保持不变
    pub fn next_agent(&self, current: &AgentRef, selected: Option<&str>) -> AgentRef {
        match (self, current) {
            (AgentState::Switch, AgentRef::Coordinator) => match selected {
                Some(name) => AgentRef::Delegate(name.to_string()),
                None => AgentRef::Coordinator,
            },
            (AgentState::Switch, AgentRef::Delegate(_)) => AgentRef::Coordinator,
            _ => current.clone(),
        }
    }

    /// 处理表：终止状态没有处理器
    pub fn handler(&self, role: AgentRole) -> Option<StepHandler> {
        if self.is_round_end() {
            return None;
        }
        match (role, self) {
            (AgentRole::Delegate, AgentState::Confirm) => Some(StepHandler::Confirm),
            _ => Some(StepHandler::Process),
        }
    }
}

/// 会话状态（供控制面查询）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Awaiting,
    WaitingRequest,
    Running,
    Confirmation,
    RoundFinished,
    Evaluating,
    SaveExp,
    Completed,
    Error,
    MaxStepReached,
}

impl SessionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            SessionStatus::Awaiting => "AWAITING",
            SessionStatus::WaitingRequest => "WAITING_REQUEST",
            SessionStatus::Running => "RUNNING",
            SessionStatus::Confirmation => "CONFIRMATION",
            SessionStatus::RoundFinished => "ROUNDFINISHED",
            SessionStatus::Evaluating => "EVALUATING",
            SessionStatus::SaveExp => "SAVEEXP",
            SessionStatus::Completed => "COMPLETED",
            SessionStatus::Error => "ERROR",
            SessionStatus::MaxStepReached => "MAX_STEP_REACHED",
        }
    }
}

/// get_state 的应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateReply {
    State(String),
    NoSessionRunning,
}

impl StateReply {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StateReply::State(name) => serde_json::json!({ "state_name": name }),
            StateReply::NoSessionRunning => {
                serde_json::json!({ "response": "No session running" })
            }
        }
    }
}

/// pause / resume / unlock / terminate 的应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Ok,
    NoSessionRunning,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_statuses() -> Vec<AgentStatus> {
        vec![
            AgentStatus::Continue,
            AgentStatus::Switch,
            AgentStatus::Confirm,
            AgentStatus::Finish,
            AgentStatus::Error,
            AgentStatus::Fail,
            AgentStatus::Unknown("WHATEVER".into()),
        ]
    }

    #[test]
    fn test_transition_is_total() {
        for role in [AgentRole::Coordinator, AgentRole::Delegate] {
            for status in all_statuses() {
                let next = AgentState::next_state(role, &status);
                assert!(AgentState::ALL.contains(&next));
                // 除终止状态外必有处理器
                assert_eq!(next.handler(role).is_none(), next.is_round_end());
            }
        }
    }

    #[test]
    fn test_coordinator_confirm_maps_to_continue() {
        assert_eq!(
            AgentState::next_state(AgentRole::Coordinator, &AgentStatus::Confirm),
            AgentState::Continue
        );
        assert_eq!(
            AgentState::next_state(AgentRole::Delegate, &AgentStatus::Confirm),
            AgentState::Confirm
        );
        assert_eq!(
            AgentState::next_state(AgentRole::Delegate, &AgentStatus::Fail),
            AgentState::Error
        );
    }

    #[test]
    fn test_switch_hands_over_control() {
        let to_delegate =
            AgentState::Switch.next_agent(&AgentRef::Coordinator, Some("Delegate/notepad.exe"));
        assert_eq!(to_delegate, AgentRef::Delegate("Delegate/notepad.exe".into()));

        let back = AgentState::Switch.next_agent(&to_delegate, None);
        assert_eq!(back, AgentRef::Coordinator);

        let same = AgentState::Continue.next_agent(&to_delegate, Some("other"));
        assert_eq!(same, to_delegate);
    }

    #[test]
    fn test_handler_dispatch() {
        assert_eq!(
            AgentState::Confirm.handler(AgentRole::Delegate),
            Some(StepHandler::Confirm)
        );
        assert_eq!(
            AgentState::Switch.handler(AgentRole::Delegate),
            Some(StepHandler::Process)
        );
        assert_eq!(AgentState::MaxStepReached.handler(AgentRole::Coordinator), None);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(AgentStatus::parse(" continue "), AgentStatus::Continue);
        assert_eq!(AgentStatus::parse("FINISH."), AgentStatus::Finish);
        assert_eq!(
            AgentStatus::parse("maybe"),
            AgentStatus::Unknown("maybe".into())
        );
    }

    #[test]
    fn test_state_reply_json() {
        assert_eq!(
            StateReply::State("CONTINUE".into()).to_json()["state_name"],
            "CONTINUE"
        );
        assert_eq!(
            StateReply::NoSessionRunning.to_json()["response"],
            "No session running"
        );
    }
}
