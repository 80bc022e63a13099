//! Mock 后端（用于测试与演练，无需 API）
//!
//! MockLlmClient 按顺序回放预置文本；ScriptedPrompter 直接回放 Decision 并统计调用次数。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{Decision, LlmClient, PromptError, PromptRequest, Prompter, TokenStream};
use crate::memory::Message;

const MOCK_FINISH: &str = r#"{"Status": "FINISH", "Comment": "mock backend"}"#;

/// Mock 客户端：依次返回预置回复，耗尽后返回 FINISH 决策
#[derive(Debug, Default)]
pub struct MockLlmClient {
    responses: Mutex<VecDeque<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, String> {
        Ok(self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| MOCK_FINISH.to_string()))
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<TokenStream, String> {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}

type CallHook = Box<dyn Fn(usize) + Send + Sync>;

/// 脚本化 Prompter：按顺序返回 Decision，耗尽后返回 FINISH
pub struct ScriptedPrompter {
    decisions: Mutex<VecDeque<Result<Decision, PromptError>>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<String>>,
    on_call: Option<CallHook>,
}

impl ScriptedPrompter {
    pub fn new(decisions: Vec<Decision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().map(Ok).collect()),
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            on_call: None,
        }
    }

    /// 在脚本末尾追加一个错误
    pub fn then_error(self, err: PromptError) -> Self {
        self.decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Err(err));
        self
    }

    /// 每次调用时以调用序号（从 1 开始）回调
    pub fn on_call(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// 每次调用收到的请求文本
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn complete(&self, request: &PromptRequest) -> Result<Decision, PromptError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.request.clone());
        if let Some(hook) = &self.on_call {
            hook(n);
        }
        let next = self
            .decisions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        next.unwrap_or_else(|| Ok(Decision::new("FINISH")))
    }
}
