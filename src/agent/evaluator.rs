//! 评估者：根据请求与 response.log 中的轨迹判断任务是否完成
//!
//! 与 Critic 类似：一次轻量 LLM 调用，要求模型只输出 JSON（complete / reason / sub_scores）。

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::{extract_json, LlmClient};
use crate::memory::Message;
use crate::observability::{read_jsonl, RESPONSE_LOG};

const EVALUATOR_PROMPT: &str = "You evaluate whether a Windows desktop agent completed the user's requests. \
Read the requests and the step trajectory, then reply with only one JSON object: \
{\"complete\": \"yes\" | \"no\" | \"unsure\", \"reason\": \"...\", \"sub_scores\": {\"<aspect>\": \"yes\" | \"no\"}}";

/// 轨迹只取最近若干步，避免超长上下文
const MAX_TRAJECTORY_STEPS: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub complete: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub sub_scores: BTreeMap<String, String>,
}

impl EvaluationResult {
    pub fn is_complete(&self) -> bool {
        self.complete.trim().eq_ignore_ascii_case("yes")
    }
}

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("LLM error: {0}")]
    Llm(String),

    #[error("unparsable evaluation: {0}")]
    Parse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    /// 返回评估结果与本次评估成本
    async fn evaluate(
        &self,
        requests: &[String],
        log_path: &Path,
    ) -> Result<(EvaluationResult, f64), EvaluationError>;
}

pub struct LlmEvaluator {
    llm: Arc<dyn LlmClient>,
    cost_per_1k_tokens: f64,
}

impl LlmEvaluator {
    pub fn new(llm: Arc<dyn LlmClient>, cost_per_1k_tokens: f64) -> Self {
        Self {
            llm,
            cost_per_1k_tokens,
        }
    }

    fn trajectory(log_path: &Path) -> Result<String, EvaluationError> {
        let entries = read_jsonl(log_path.join(RESPONSE_LOG))?;
        let skip = entries.len().saturating_sub(MAX_TRAJECTORY_STEPS);
        let lines: Vec<String> = entries
            .iter()
            .skip(skip)
            .map(|e| {
                format!(
                    "Step {} [{}] {} {} {}",
                    e["Step"],
                    e["Agent"].as_str().unwrap_or(""),
                    e["Status"].as_str().unwrap_or(""),
                    e["Function"].as_str().unwrap_or(""),
                    e["Thought"].as_str().unwrap_or("")
                )
                .trim_end()
                .to_string()
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

#[async_trait]
impl Evaluator for LlmEvaluator {
    async fn evaluate(
        &self,
        requests: &[String],
        log_path: &Path,
    ) -> Result<(EvaluationResult, f64), EvaluationError> {
        let trajectory = Self::trajectory(log_path)?;
        let prompt = format!(
            "## Requests\n{}\n\n## Trajectory\n{}",
            requests
                .iter()
                .map(|r| format!("- {}", r))
                .collect::<Vec<_>>()
                .join("\n"),
            trajectory
        );
        let messages = vec![Message::system(EVALUATOR_PROMPT), Message::user(prompt)];

        let (_, _, before) = self.llm.token_usage();
        let mut stream = self
            .llm
            .complete_stream(&messages)
            .await
            .map_err(EvaluationError::Llm)?;
        let mut response = String::new();
        while let Some(token) = stream.next().await {
            response.push_str(&token.map_err(EvaluationError::Llm)?);
        }
        let (_, _, after) = self.llm.token_usage();

        let json = extract_json(&response)
            .ok_or_else(|| EvaluationError::Parse(response.trim().to_string()))?;
        let result: EvaluationResult = serde_json::from_str(json)
            .map_err(|e| EvaluationError::Parse(format!("{}: {}", e, json)))?;
        let cost = after.saturating_sub(before) as f64 / 1000.0 * self.cost_per_1k_tokens.max(0.0);
        tracing::info!(complete = %result.complete, "evaluation finished");
        Ok((result, cost))
    }
}
