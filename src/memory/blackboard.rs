//! 黑板：协调者与委托者共享的请求列表与动作轨迹
//!
//! 请求列表也是会话评估的输入（普通模式）。

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Blackboard {
    requests: Vec<String>,
    trajectories: Vec<String>,
}

impl Blackboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_request(&mut self, request: impl Into<String>) {
        self.requests.push(request.into());
    }

    pub fn add_trajectory(&mut self, entry: impl Into<String>) {
        self.trajectories.push(entry.into());
    }

    pub fn requests(&self) -> &[String] {
        &self.requests
    }

    pub fn trajectories(&self) -> &[String] {
        &self.trajectories
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.trajectories.is_empty()
    }

    /// 拼入 Prompt 的片段（Previous Requests / Trajectory）
    pub fn to_prompt_section(&self) -> String {
        let mut s = String::new();
        if !self.requests.is_empty() {
            s.push_str("## Previous Requests\n");
            for r in &self.requests {
                s.push_str(&format!("- {}\n", r));
            }
            s.push('\n');
        }
        if !self.trajectories.is_empty() {
            s.push_str("## Trajectory\n");
            for t in &self.trajectories {
                s.push_str(&format!("- {}\n", t));
            }
            s.push('\n');
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_section() {
        let mut board = Blackboard::new();
        assert!(board.to_prompt_section().is_empty());

        board.add_request("close Notepad");
        board.add_trajectory("select Untitled - Notepad");
        let section = board.to_prompt_section();
        assert!(section.contains("## Previous Requests\n- close Notepad"));
        assert!(section.contains("## Trajectory"));

        board.clear_requests();
        assert!(board.requests().is_empty());
        assert!(!board.is_empty());
    }
}
