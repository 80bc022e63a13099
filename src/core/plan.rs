//! 跟随模式计划：按步回放预先记录的请求
//!
//! 计划文件格式：`{ "task": "...", "object": "...", "steps": ["...", ...] }`。
//! 第一轮发给协调者（选中 object 所指应用），之后每轮把下一步交给当前委托者。

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::SessionError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanReader {
    pub task: String,
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    /// 协调者请求是否已发出
    #[serde(default)]
    host_done: bool,
    #[serde(default)]
    cursor: usize,
}

impl PlanReader {
    pub fn new(task: impl Into<String>, object: Option<String>, steps: Vec<String>) -> Self {
        Self {
            task: task.into(),
            object,
            steps,
            host_done: false,
            cursor: 0,
        }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Plan(format!("{}: {}", path.display(), e)))?;
        let mut plan: PlanReader = serde_json::from_str(&data)
            .map_err(|e| SessionError::Plan(format!("{}: {}", path.display(), e)))?;
        plan.host_done = false;
        plan.cursor = 0;
        Ok(plan)
    }

    /// 协调者的请求：有 object 时要求选中该应用后立即 FINISH
    pub fn host_request(&self) -> String {
        match self.object.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
            Some(object) => format!(
                "Open and select the application of {}, and output FINISH immediately.",
                object
            ),
            None => self.task.clone(),
        }
    }

    /// 下一条请求：先是协调者请求，然后依次是各步骤
    pub fn next_request(&mut self) -> Option<String> {
        if !self.host_done {
            self.host_done = true;
            return Some(self.host_request());
        }
        let step = self.steps.get(self.cursor).cloned()?;
        self.cursor += 1;
        Some(step)
    }

    /// 协调者请求尚未发出（即下一轮是第一轮）
    pub fn host_pending(&self) -> bool {
        !self.host_done
    }

    pub fn is_finished(&self) -> bool {
        self.host_done && self.cursor >= self.steps.len()
    }

    pub fn remaining(&self) -> usize {
        self.steps.len().saturating_sub(self.cursor)
    }
}
