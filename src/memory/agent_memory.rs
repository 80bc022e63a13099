//! 智能体记忆：按步记录的决策与执行结果
//!
//! 每个智能体持有一份有界 Memory，超出上限时丢弃最旧的条目；to_messages 生成喂给 Prompter 的历史。

use serde::{Deserialize, Serialize};

use crate::memory::Message;

/// 单步记忆
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub round: u32,
    pub step: u64,
    pub status: String,
    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub comment: String,
}

impl MemoryItem {
    pub fn new(round: u32, step: u64, status: impl Into<String>) -> Self {
        Self {
            round,
            step,
            status: status.into(),
            thought: String::new(),
            action: None,
            result: None,
            comment: String::new(),
        }
    }

    /// 失败条目：下一次决策能看到失败原因
    pub fn failure(round: u32, step: u64, reason: impl Into<String>) -> Self {
        let mut item = Self::new(round, step, "FAIL");
        item.result = Some(reason.into());
        item
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = thought.into();
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = comment.into();
        self
    }
}

/// 有界记忆
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    items: Vec<MemoryItem>,
    limit: usize,
}

impl Memory {
    pub fn new(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            limit: limit.max(1),
        }
    }

    pub fn add(&mut self, item: MemoryItem) {
        self.items.push(item);
        if self.items.len() > self.limit {
            let excess = self.items.len() - self.limit;
            self.items.drain(..excess);
        }
    }

    /// 给最近一条记忆补充执行结果
    pub fn set_last_result(&mut self, result: impl Into<String>) {
        if let Some(last) = self.items.last_mut() {
            last.result = Some(result.into());
        }
    }

    pub fn items(&self) -> &[MemoryItem] {
        &self.items
    }

    pub fn last(&self) -> Option<&MemoryItem> {
        self.items.last()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// 每条记忆转为一条 assistant 消息（JSON），失败原因追加为 user 消息
    pub fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.items.len());
        for item in &self.items {
            match serde_json::to_string(item) {
                Ok(json) => messages.push(Message::assistant(json)),
                Err(e) => tracing::warn!(error = %e, "failed to serialize memory item"),
            }
            if item.status == "FAIL" {
                if let Some(reason) = &item.result {
                    messages.push(Message::user(format!(
                        "The previous action failed: {}. Please try another way.",
                        reason
                    )));
                }
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_is_bounded() {
        let mut memory = Memory::new(2);
        for step in 0..5 {
            memory.add(MemoryItem::new(0, step, "CONTINUE"));
        }
        assert_eq!(memory.len(), 2);
        assert_eq!(memory.items()[0].step, 3);
        assert_eq!(memory.last().map(|i| i.step), Some(4));
    }

    #[test]
    fn test_failure_becomes_user_hint() {
        let mut memory = Memory::new(10);
        memory.add(MemoryItem::new(0, 1, "CONTINUE").with_action("click_input"));
        memory.add(MemoryItem::failure(0, 2, "control not found"));

        let messages = memory.to_messages();
        assert_eq!(messages.len(), 3);
        assert!(messages[2].content.contains("control not found"));
    }
}
