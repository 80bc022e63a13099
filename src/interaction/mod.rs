//! 用户交互：请求与确认的输入源
//!
//! 会话工作线程只通过 InputSource 等待输入；控制面通过单槽 Slot 写入（覆盖写、取出即清空）。
//! 所有等待都可被 CancellationToken 打断。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// 敏感操作 / 经验保存的确认结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confirmation {
    Yes,
    No,
}

impl Confirmation {
    /// "Y" / "YES"（大小写不敏感）为 Yes，其余一律为 No
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_uppercase().as_str() {
            "Y" | "YES" => Confirmation::Yes,
            _ => Confirmation::No,
        }
    }
}

/// 输入源：阻塞等待返回 None 表示已取消或输入结束
#[async_trait]
pub trait InputSource: Send + Sync {
    async fn await_request(&self, cancel: &CancellationToken) -> Option<String>;

    async fn await_confirmation(&self, cancel: &CancellationToken) -> Option<Confirmation>;

    fn try_request(&self) -> Option<String>;

    fn try_confirmation(&self) -> Option<Confirmation>;
}

/// 单槽：put 覆盖旧值并唤醒等待者，take 原子地取出并清空
#[derive(Debug)]
pub struct Slot<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Send> Slot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    pub fn put(&self, value: T) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = Some(value);
        self.notify.notify_one();
    }

    pub fn try_take(&self) -> Option<T> {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub async fn take(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if let Some(value) = self.try_take() {
                return Some(value);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }
}

impl<T: Send> Default for Slot<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 由控制面驱动的输入（submit_request / submit_confirmation）
#[derive(Debug, Default)]
pub struct SlotInput {
    requests: Slot<String>,
    confirmations: Slot<Confirmation>,
}

impl SlotInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_request(&self, request: impl Into<String>) {
        self.requests.put(request.into());
    }

    pub fn submit_confirmation(&self, answer: Confirmation) {
        self.confirmations.put(answer);
    }
}

#[async_trait]
impl InputSource for SlotInput {
    async fn await_request(&self, cancel: &CancellationToken) -> Option<String> {
        self.requests.take(cancel).await
    }

    async fn await_confirmation(&self, cancel: &CancellationToken) -> Option<Confirmation> {
        self.confirmations.take(cancel).await
    }

    fn try_request(&self) -> Option<String> {
        self.requests.try_take()
    }

    fn try_confirmation(&self) -> Option<Confirmation> {
        self.confirmations.try_take()
    }
}

/// 预置脚本输入：按顺序依次给出请求与确认；耗尽后请求返回 "N"，确认返回 No
#[derive(Debug, Default)]
pub struct ScriptedInput {
    requests: Mutex<VecDeque<String>>,
    confirmations: Mutex<VecDeque<Confirmation>>,
}

impl ScriptedInput {
    pub fn new<I, S>(requests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            requests: Mutex::new(requests.into_iter().map(Into::into).collect()),
            confirmations: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_confirmations(self, answers: impl IntoIterator<Item = Confirmation>) -> Self {
        self.confirmations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(answers);
        self
    }
}

#[async_trait]
impl InputSource for ScriptedInput {
    async fn await_request(&self, cancel: &CancellationToken) -> Option<String> {
        if cancel.is_cancelled() {
            return None;
        }
        Some(self.try_request().unwrap_or_else(|| "N".to_string()))
    }

    async fn await_confirmation(&self, cancel: &CancellationToken) -> Option<Confirmation> {
        if cancel.is_cancelled() {
            return None;
        }
        Some(self.try_confirmation().unwrap_or(Confirmation::No))
    }

    fn try_request(&self) -> Option<String> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn try_confirmation(&self) -> Option<Confirmation> {
        self.confirmations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

/// 标准输入：CLI 使用，每行一个请求或确认
pub struct StdinInput {
    lines: tokio::sync::Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinInput {
    pub fn new() -> Self {
        Self {
            lines: tokio::sync::Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    async fn read_line(&self, prompt: &str, cancel: &CancellationToken) -> Option<String> {
        println!("{}", prompt);
        let mut lines = self.lines.lock().await;
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => Some(line.trim().to_string()),
                Ok(None) => None,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read stdin");
                    None
                }
            },
            _ = cancel.cancelled() => None,
        }
    }
}

impl Default for StdinInput {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InputSource for StdinInput {
    async fn await_request(&self, cancel: &CancellationToken) -> Option<String> {
        self.read_line("Please enter your request (N to exit):", cancel)
            .await
    }

    async fn await_confirmation(&self, cancel: &CancellationToken) -> Option<Confirmation> {
        self.read_line("Confirm? [Y/N]:", cancel)
            .await
            .map(|line| Confirmation::parse(&line))
    }

    fn try_request(&self) -> Option<String> {
        None
    }

    fn try_confirmation(&self) -> Option<Confirmation> {
        None
    }
}
