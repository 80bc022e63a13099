//! Prompter：把智能体上下文变成一次 LLM 决策
//!
//! 决策是一个 JSON 对象（PascalCase 字段，与提示中的 schema 一致）；parse_decision 容忍 ```json 围栏与前后多余文本。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actuator::{Action, WindowDescriptor};
use crate::core::state::{AgentRole, AgentStatus};
use crate::llm::{decision_schema_json, LlmClient};
use crate::memory::Message;

pub const COORDINATOR_SYSTEM_PROMPT: &str = "You are the coordinator of a Windows desktop agent. \
Pick the application window that best serves the user request. \
Set Status to SWITCH and Target to the window title to hand control to that application, \
FINISH when the request is already satisfied, ERROR when it cannot be satisfied.";

pub const DELEGATE_SYSTEM_PROMPT: &str = "You operate one Windows application on behalf of the user. \
Choose exactly one action per step through Function / Args / ControlText. \
Use CONTINUE while more actions are needed, CONFIRM for sensitive actions that need the user's approval, \
SWITCH to hand control back to the coordinator, FINISH when the request is complete.";

/// 一次 LLM 决策
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct Decision {
    /// CONTINUE / SWITCH / CONFIRM / FINISH / ERROR
    pub status: String,
    /// 协调者选中的应用窗口标题
    #[serde(default)]
    pub target: Option<String>,
    /// 委托者要执行的函数名
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub control_text: Option<String>,
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub plan: Vec<String>,
    #[serde(default)]
    pub comment: String,
    /// 本次调用成本；后端不提供用量时为 None
    #[serde(skip)]
    pub cost: Option<f64>,
}

impl Decision {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            ..Default::default()
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_action(mut self, function: impl Into<String>, args: serde_json::Value) -> Self {
        self.function = Some(function.into());
        self.args = args;
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn agent_status(&self) -> AgentStatus {
        AgentStatus::parse(&self.status)
    }

    /// 函数名为空时没有动作
    pub fn action(&self) -> Option<Action> {
        let function = self.function.as_deref().map(str::trim).filter(|f| !f.is_empty())?;
        Some(Action {
            function: function.to_string(),
            args: self.args.clone(),
            control_text: self.control_text.clone(),
        })
    }
}

/// 组装给 Prompter 的输入
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub role: AgentRole,
    pub agent_name: String,
    pub request: String,
    /// 该智能体的记忆（已转为消息）
    pub history: Vec<Message>,
    /// 额外上下文（黑板、当前应用等）
    pub context_section: String,
    /// 协调者可选的应用窗口
    pub candidates: Vec<WindowDescriptor>,
}

impl PromptRequest {
    pub fn to_user_prompt(&self) -> String {
        let mut s = format!("## User Request\n{}\n\n", self.request);
        s.push_str(&self.context_section);
        if !self.candidates.is_empty() {
            s.push_str("## Available Applications\n");
            for c in &self.candidates {
                s.push_str(&format!("- {} ({})\n", c.title, c.process_name));
            }
        }
        s
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PromptError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("unparsable decision: {0}")]
    Parse(String),

    #[error("decision has no status")]
    MissingStatus,
}

/// 决策来源：LLM 或脚本
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn complete(&self, request: &PromptRequest) -> Result<Decision, PromptError>;
}

/// 从文本中取出 JSON 对象：优先 ```json 围栏，其次首个 '{' 到最后一个 '}'
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

pub fn parse_decision(output: &str) -> Result<Decision, PromptError> {
    let json = extract_json(output).ok_or_else(|| PromptError::Parse(output.trim().to_string()))?;
    let decision: Decision =
        serde_json::from_str(json).map_err(|e| PromptError::Parse(format!("{}: {}", e, json)))?;
    if decision.status.trim().is_empty() {
        return Err(PromptError::MissingStatus);
    }
    Ok(decision)
}

/// 基于 LlmClient 的 Prompter：system prompt + 决策 schema + 记忆 + 当前请求
pub struct LlmPrompter {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    /// 每千 token 费用；<= 0 时成本不可用
    cost_per_1k_tokens: f64,
}

impl LlmPrompter {
    pub fn new(llm: Arc<dyn LlmClient>, system_prompt: impl Into<String>) -> Self {
        Self {
            llm,
            system_prompt: system_prompt.into(),
            cost_per_1k_tokens: 0.0,
        }
    }

    pub fn coordinator(llm: Arc<dyn LlmClient>) -> Self {
        Self::new(llm, COORDINATOR_SYSTEM_PROMPT)
    }

    pub fn delegate(llm: Arc<dyn LlmClient>) -> Self {
        Self::new(llm, DELEGATE_SYSTEM_PROMPT)
    }

    pub fn with_price(mut self, cost_per_1k_tokens: f64) -> Self {
        self.cost_per_1k_tokens = cost_per_1k_tokens;
        self
    }

    fn cost_of(&self, tokens: u64) -> Option<f64> {
        if tokens == 0 || self.cost_per_1k_tokens <= 0.0 {
            return None;
        }
        Some(tokens as f64 / 1000.0 * self.cost_per_1k_tokens)
    }

    fn build_messages(&self, request: &PromptRequest) -> Vec<Message> {
        let system = format!(
            "{}\n\n## Response Format\nReply with exactly one JSON object matching this schema:\n{}",
            self.system_prompt,
            decision_schema_json()
        );
        let mut messages = vec![Message::system(system)];
        messages.extend(request.history.iter().cloned());
        messages.push(Message::user(request.to_user_prompt()));
        messages
    }
}

#[async_trait]
impl Prompter for LlmPrompter {
    async fn complete(&self, request: &PromptRequest) -> Result<Decision, PromptError> {
        let messages = self.build_messages(request);
        let (_, _, before) = self.llm.token_usage();
        let raw = self
            .llm
            .complete(&messages)
            .await
            .map_err(PromptError::Llm)?;
        let (_, _, after) = self.llm.token_usage();

        let mut decision = parse_decision(&raw)?;
        decision.cost = self.cost_of(after.saturating_sub(before));
        tracing::debug!(
            agent = %request.agent_name,
            status = %decision.status,
            "decision parsed"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[test]
    fn test_parse_fenced_decision() {
        let raw = "Sure.\n```json\n{\"Status\": \"SWITCH\", \"Target\": \"Untitled - Notepad\"}\n```";
        let decision = parse_decision(raw).unwrap();
        assert_eq!(decision.agent_status(), AgentStatus::Switch);
        assert_eq!(decision.target.as_deref(), Some("Untitled - Notepad"));
        assert!(decision.action().is_none());
    }

    #[test]
    fn test_parse_bare_json_with_action() {
        let raw = r#"I will close it. {"Status":"CONTINUE","Function":"close_window","Args":{}}"#;
        let decision = parse_decision(raw).unwrap();
        let action = decision.action().unwrap();
        assert_eq!(action.function, "close_window");
        assert_eq!(decision.cost, None);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_decision("no json here"),
            Err(PromptError::Parse(_))
        ));
        assert_eq!(
            parse_decision(r#"{"Status": "  "}"#),
            Err(PromptError::MissingStatus)
        );
        assert!(matches!(
            parse_decision(r#"{"Thought": "missing"}"#),
            Err(PromptError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_llm_prompter_without_usage_has_no_cost() {
        let llm = Arc::new(MockLlmClient::with_responses(vec![
            r#"{"Status": "FINISH", "Comment": "done"}"#.to_string(),
        ]));
        let prompter = LlmPrompter::coordinator(llm).with_price(0.01);
        let request = PromptRequest {
            role: AgentRole::Coordinator,
            agent_name: "Coordinator".into(),
            request: "close Notepad".into(),
            history: Vec::new(),
            context_section: String::new(),
            candidates: Vec::new(),
        };
        let decision = prompter.complete(&request).await.unwrap();
        assert_eq!(decision.agent_status(), AgentStatus::Finish);
        assert_eq!(decision.cost, None);
    }

    #[test]
    fn test_cost_from_tokens() {
        let prompter = LlmPrompter::delegate(Arc::new(MockLlmClient::new())).with_price(0.5);
        assert_eq!(prompter.cost_of(2000), Some(1.0));
        assert_eq!(prompter.cost_of(0), None);
    }
}
