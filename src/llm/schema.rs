//! 决策 JSON Schema：由 schemars 从 Decision 生成，拼入 system prompt

use crate::llm::Decision;

/// Decision 的 JSON Schema（pretty 格式）
pub fn decision_schema_json() -> String {
    let schema = schemars::schema_for!(Decision);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| "{}".to_string())
}
