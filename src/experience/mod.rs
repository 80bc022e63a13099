//! 经验沉淀：会话结束后把成功轨迹总结成可复用的经验
//!
//! 从 response.log 按请求分组得到步骤序列；有 LLM 时再让模型给出简短 tips，
//! 最后合并写入 `<saved_path>/experience.json`。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::observability::{read_jsonl, RESPONSE_LOG};

pub const EXPERIENCE_FILE: &str = "experience.json";

const SUMMARY_PROMPT: &str = "Summarize the following desktop automation trajectory into at most three short, \
reusable tips for completing the same request again. Reply with one tip per line and nothing else.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperienceSummary {
    pub request: String,
    pub steps: Vec<String>,
    #[serde(default)]
    pub tips: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ExperienceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("LLM error: {0}")]
    Llm(String),
}

#[async_trait]
pub trait ExperienceStore: Send + Sync {
    /// 根据会话日志目录生成经验，返回经验与总结成本
    async fn summarize(
        &self,
        log_path: &Path,
    ) -> Result<(Vec<ExperienceSummary>, f64), ExperienceError>;

    async fn persist(&self, summaries: &[ExperienceSummary]) -> Result<(), ExperienceError>;
}

pub struct JsonExperienceStore {
    saved_path: PathBuf,
    llm: Option<Arc<dyn LlmClient>>,
    cost_per_1k_tokens: f64,
}

impl JsonExperienceStore {
    pub fn new(saved_path: impl AsRef<Path>) -> Self {
        Self {
            saved_path: saved_path.as_ref().to_path_buf(),
            llm: None,
            cost_per_1k_tokens: 0.0,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>, cost_per_1k_tokens: f64) -> Self {
        self.llm = Some(llm);
        self.cost_per_1k_tokens = cost_per_1k_tokens;
        self
    }

    pub fn file_path(&self) -> PathBuf {
        self.saved_path.join(EXPERIENCE_FILE)
    }

    pub fn load(&self) -> Result<Vec<ExperienceSummary>, ExperienceError> {
        let path = self.file_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// 按请求分组，保持首次出现的顺序
    fn group_by_request(log_path: &Path) -> Result<Vec<ExperienceSummary>, ExperienceError> {
        let entries = read_jsonl(log_path.join(RESPONSE_LOG))?;
        let mut order: Vec<String> = Vec::new();
        let mut steps: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for entry in &entries {
            let request = entry["Request"].as_str().unwrap_or("").to_string();
            if request.is_empty() {
                continue;
            }
            let step = match entry["Function"].as_str().filter(|f| !f.is_empty()) {
                Some(function) => format!("[{}] {}({})", entry["Agent"].as_str().unwrap_or(""), function, entry["Args"]),
                None => format!(
                    "[{}] {}",
                    entry["Agent"].as_str().unwrap_or(""),
                    entry["Status"].as_str().unwrap_or("")
                ),
            };
            if !steps.contains_key(&request) {
                order.push(request.clone());
            }
            steps.entry(request).or_default().push(step);
        }
        Ok(order
            .into_iter()
            .map(|request| {
                let steps = steps.remove(&request).unwrap_or_default();
                ExperienceSummary {
                    request,
                    steps,
                    tips: Vec::new(),
                }
            })
            .collect())
    }
}

#[async_trait]
impl ExperienceStore for JsonExperienceStore {
    async fn summarize(
        &self,
        log_path: &Path,
    ) -> Result<(Vec<ExperienceSummary>, f64), ExperienceError> {
        let mut summaries = Self::group_by_request(log_path)?;
        let Some(llm) = &self.llm else {
            return Ok((summaries, 0.0));
        };

        let (_, _, before) = llm.token_usage();
        for summary in summaries.iter_mut() {
            let messages = vec![
                Message::system(SUMMARY_PROMPT),
                Message::user(format!(
                    "Request: {}\nSteps:\n{}",
                    summary.request,
                    summary.steps.join("\n")
                )),
            ];
            let reply = llm.complete(&messages).await.map_err(ExperienceError::Llm)?;
            summary.tips = reply
                .lines()
                .map(|l| l.trim().trim_start_matches('-').trim().to_string())
                .filter(|l| !l.is_empty())
                .take(3)
                .collect();
        }
        let (_, _, after) = llm.token_usage();
        let cost = after.saturating_sub(before) as f64 / 1000.0 * self.cost_per_1k_tokens.max(0.0);
        Ok((summaries, cost))
    }

    /// 与已有经验合并：同一请求以新经验为准
    async fn persist(&self, summaries: &[ExperienceSummary]) -> Result<(), ExperienceError> {
        let mut merged = self.load()?;
        for summary in summaries {
            match merged.iter_mut().find(|s| s.request == summary.request) {
                Some(existing) => *existing = summary.clone(),
                None => merged.push(summary.clone()),
            }
        }
        std::fs::create_dir_all(&self.saved_path)?;
        std::fs::write(self.file_path(), serde_json::to_string_pretty(&merged)?)?;
        tracing::info!(path = %self.file_path().display(), count = merged.len(), "experience saved");
        Ok(())
    }
}
