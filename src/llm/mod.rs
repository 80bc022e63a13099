//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock）、决策 Prompter

pub mod mock;
pub mod openai;
pub mod prompter;
pub mod schema;
pub mod traits;

use std::sync::Arc;

pub use mock::{MockLlmClient, ScriptedPrompter};
pub use openai::{OpenAiClient, TokenUsage};
pub use prompter::{
    extract_json, parse_decision, Decision, LlmPrompter, PromptError, PromptRequest, Prompter,
};
pub use schema::decision_schema_json;
pub use traits::{LlmClient, TokenStream};

use crate::config::LlmSection;

/// 按 [llm] 配置创建客户端；provider = "mock" 或未设置 OPENAI_API_KEY 时使用 Mock
pub fn create_llm_from_config(section: &LlmSection) -> Arc<dyn LlmClient> {
    let has_key = std::env::var("OPENAI_API_KEY")
        .map(|k| !k.trim().is_empty())
        .unwrap_or(false);
    if section.provider.eq_ignore_ascii_case("mock") || !has_key {
        tracing::warn!(provider = %section.provider, "using mock LLM backend");
        return Arc::new(MockLlmClient::new());
    }
    tracing::info!(model = %section.model, "using OpenAI-compatible backend");
    Arc::new(OpenAiClient::new(
        section.base_url.as_deref(),
        &section.model,
        None,
    ))
}
