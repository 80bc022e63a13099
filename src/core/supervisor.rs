//! 会话监管：控制面与工作任务之间的唯一通道
//!
//! 持有 CancellationToken（terminate）、暂停闸门（watch）、输入单槽、应用选择确认闸门，
//! 以及工作任务发布的状态 / 当前轮状态 / 最新快照。控制面只写闸门与输入，只读发布值。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::core::snapshot::SessionSnapshot;
use crate::core::state::{AgentState, ControlReply, SessionStatus};
use crate::interaction::{Confirmation, SlotInput};

#[derive(Debug)]
pub struct SessionControl {
    cancel_token: CancellationToken,
    paused: watch::Sender<bool>,
    input: Arc<SlotInput>,
    /// 应用选择闸门（一次性：每次解锁放行一次等待）
    selection_open: AtomicBool,
    selection_notify: Notify,
    /// 全局确认锁，由 SessionManager 共享给所有会话
    selection_lock: Arc<AtomicBool>,
    status: RwLock<SessionStatus>,
    round_state: RwLock<Option<AgentState>>,
    snapshot: RwLock<Option<SessionSnapshot>>,
}

impl SessionControl {
    pub fn new(selection_lock: Arc<AtomicBool>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel_token: CancellationToken::new(),
            paused,
            input: Arc::new(SlotInput::new()),
            selection_open: AtomicBool::new(false),
            selection_notify: Notify::new(),
            selection_lock,
            status: RwLock::new(SessionStatus::Awaiting),
            round_state: RwLock::new(None),
            snapshot: RwLock::new(None),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 终止：取消所有等待并打开闸门；之后 get_state 返回 NoSessionRunning
    pub fn terminate(&self) {
        {
            // 取消与清空在同一把写锁内完成，publish_round_state 不会在两者之间写入
            let mut round_state = self.round_state.write().unwrap_or_else(|e| e.into_inner());
            self.cancel_token.cancel();
            *round_state = None;
        }
        self.paused.send_replace(false);
        self.unlock_selection();
        tracing::info!("session terminated");
    }

    pub fn pause(&self) -> ControlReply {
        if self.round_state().is_none() {
            return ControlReply::NoSessionRunning;
        }
        self.paused.send_replace(true);
        ControlReply::Ok
    }

    pub fn resume(&self) -> ControlReply {
        if self.round_state().is_none() {
            return ControlReply::NoSessionRunning;
        }
        self.paused.send_replace(false);
        ControlReply::Ok
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// 暂停时阻塞直到恢复；返回 false 表示等待期间（或之前）已被终止
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel_token.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tracing::debug!("session paused");
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = self.cancel_token.cancelled() => return false,
            }
        }
    }

    pub fn selection_locked(&self) -> bool {
        self.selection_lock.load(Ordering::SeqCst)
    }

    pub fn unlock_selection(&self) {
        self.selection_open.store(true, Ordering::SeqCst);
        self.selection_notify.notify_one();
    }

    /// 等待应用选择解锁；返回 false 表示被终止
    pub async fn wait_selection_unlock(&self) -> bool {
        loop {
            if self.selection_open.swap(false, Ordering::SeqCst) {
                return !self.cancel_token.is_cancelled();
            }
            if self.cancel_token.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = self.selection_notify.notified() => {}
                _ = self.cancel_token.cancelled() => return false,
            }
        }
    }

    pub fn input(&self) -> Arc<SlotInput> {
        self.input.clone()
    }

    pub fn submit_request(&self, request: impl Into<String>) {
        self.input.submit_request(request);
    }

    pub fn submit_confirmation(&self, answer: Confirmation) {
        self.input.submit_confirmation(answer);
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_status(&self, status: SessionStatus) {
        let mut current = self.status.write().unwrap_or_else(|e| e.into_inner());
        if *current != status {
            tracing::debug!(from = current.name(), to = status.name(), "session status");
            *current = status;
        }
    }

    pub fn round_state(&self) -> Option<AgentState> {
        *self.round_state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// 终止后不再发布
    pub fn publish_round_state(&self, state: AgentState) {
        let mut round_state = self.round_state.write().unwrap_or_else(|e| e.into_inner());
        if self.is_cancelled() {
            return;
        }
        *round_state = Some(state);
    }

    pub fn clear_round_state(&self) {
        *self.round_state.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn publish_snapshot(&self, snapshot: SessionSnapshot) {
        *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<SessionSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for SessionControl {
    fn default() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }
}
