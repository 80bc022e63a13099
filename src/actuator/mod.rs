//! 执行器：窗口发现、最小化、动作执行与快照
//!
//! 真实 UI 自动化不在本 crate 内；这里只定义 Actuator trait、可序列化的窗口描述符，
//! 以及一个记录所有调用的 DryRunActuator（CLI 与测试使用）。

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 窗口描述符：可序列化，不持有任何活动句柄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowDescriptor {
    pub process_id: u32,
    pub title: String,
    pub class_name: String,
    /// 可执行文件名（如 notepad.exe）
    pub process_name: String,
}

/// 活动窗口句柄
pub trait LiveWindow: Send + Sync {
    fn descriptor(&self) -> &WindowDescriptor;
    fn is_alive(&self) -> bool;
}

/// 窗口引用：描述符 + 可选的活动句柄（快照恢复后需 resolve）
#[derive(Clone)]
pub struct WindowRef {
    descriptor: WindowDescriptor,
    live: Option<Arc<dyn LiveWindow>>,
}

impl WindowRef {
    pub fn live(handle: Arc<dyn LiveWindow>) -> Self {
        Self {
            descriptor: handle.descriptor().clone(),
            live: Some(handle),
        }
    }

    pub fn unresolved(descriptor: WindowDescriptor) -> Self {
        Self {
            descriptor,
            live: None,
        }
    }

    pub fn descriptor(&self) -> &WindowDescriptor {
        &self.descriptor
    }

    pub fn title(&self) -> &str {
        &self.descriptor.title
    }

    pub fn is_resolved(&self) -> bool {
        self.live.is_some()
    }

    /// 已解析且窗口仍存在
    pub fn is_alive(&self) -> bool {
        self.live.as_ref().map(|w| w.is_alive()).unwrap_or(false)
    }

    /// 通过执行器重新绑定活动句柄；找不到时保持未解析
    pub async fn resolve(&mut self, actuator: &dyn Actuator) -> bool {
        if self.is_resolved() {
            return true;
        }
        match actuator.resolve(&self.descriptor).await {
            Some(resolved) => {
                self.live = resolved.live;
                self.is_resolved()
            }
            None => false,
        }
    }
}

impl fmt::Debug for WindowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowRef")
            .field("descriptor", &self.descriptor)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// 委托者决定的应用内动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub function: String,
    #[serde(default)]
    pub args: serde_json::Value,
    #[serde(default)]
    pub control_text: Option<String>,
}

impl Action {
    pub fn new(function: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            function: function.into(),
            args,
            control_text: None,
        }
    }

    /// 写入记忆 / 轨迹的一行摘要
    pub fn describe(&self) -> String {
        match &self.control_text {
            Some(text) => format!("{}({}) on [{}]", self.function, self.args, text),
            None => format!("{}({})", self.function, self.args),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActuatorError {
    /// 动作被目标应用拒绝（控件不存在、参数非法等）
    #[error("action rejected: {0}")]
    Rejected(String),

    #[error("window unavailable: {0}")]
    WindowUnavailable(String),

    #[error("actuator failure: {0}")]
    Failed(String),
}

/// 执行器：所有真实 UI 自动化都在此 trait 之后
#[async_trait]
pub trait Actuator: Send + Sync {
    /// 当前可供协调者选择的桌面窗口
    async fn list_candidate_windows(&self) -> Result<Vec<WindowRef>, ActuatorError>;

    async fn minimize(&self, window: &WindowRef) -> Result<(), ActuatorError>;

    /// 执行动作，返回执行结果描述
    async fn execute(&self, window: &WindowRef, action: &Action) -> Result<String, ActuatorError>;

    /// 按描述符查找活动窗口（快照恢复后使用）
    async fn resolve(&self, descriptor: &WindowDescriptor) -> Option<WindowRef>;

    /// 将窗口快照写入 path
    async fn capture_snapshot(&self, window: &WindowRef, path: &Path) -> Result<(), ActuatorError>;
}

/// 演练窗口：关闭动作后不再存活
#[derive(Debug)]
struct DryWindow {
    descriptor: WindowDescriptor,
    alive: AtomicBool,
}

impl LiveWindow for DryWindow {
    fn descriptor(&self) -> &WindowDescriptor {
        &self.descriptor
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// 演练执行器：不操作真实桌面，只记录调用
#[derive(Debug, Default)]
pub struct DryRunActuator {
    windows: Vec<Arc<DryWindow>>,
    rejected: HashSet<String>,
    executed: Mutex<Vec<Action>>,
    minimized: Mutex<Vec<String>>,
    snapshots: Mutex<Vec<PathBuf>>,
}

impl DryRunActuator {
    /// 由窗口标题生成描述符：进程名取标题最后一个单词（"Untitled - Notepad" -> notepad.exe）
    pub fn new(titles: &[String]) -> Self {
        let descriptors = titles
            .iter()
            .enumerate()
            .map(|(i, title)| {
                let word = title.rsplit(' ').next().unwrap_or(title.as_str()).to_lowercase();
                WindowDescriptor {
                    process_id: 1000 + i as u32,
                    title: title.clone(),
                    class_name: word.clone(),
                    process_name: format!("{}.exe", word),
                }
            })
            .collect();
        Self::with_windows(descriptors)
    }

    pub fn with_windows(descriptors: Vec<WindowDescriptor>) -> Self {
        Self {
            windows: descriptors
                .into_iter()
                .map(|descriptor| {
                    Arc::new(DryWindow {
                        descriptor,
                        alive: AtomicBool::new(true),
                    })
                })
                .collect(),
            ..Default::default()
        }
    }

    /// 让指定函数名的动作总是被拒绝
    pub fn reject_function(mut self, function: impl Into<String>) -> Self {
        self.rejected.insert(function.into());
        self
    }

    pub fn executed(&self) -> Vec<Action> {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn minimized(&self) -> Vec<String> {
        self.minimized
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn snapshots(&self) -> Vec<PathBuf> {
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn find(&self, descriptor: &WindowDescriptor) -> Option<&Arc<DryWindow>> {
        self.windows
            .iter()
            .find(|w| w.descriptor.process_id == descriptor.process_id)
    }
}

#[async_trait]
impl Actuator for DryRunActuator {
    async fn list_candidate_windows(&self) -> Result<Vec<WindowRef>, ActuatorError> {
        Ok(self
            .windows
            .iter()
            .filter(|w| w.is_alive())
            .map(|w| WindowRef::live(w.clone()))
            .collect())
    }

    async fn minimize(&self, window: &WindowRef) -> Result<(), ActuatorError> {
        self.minimized
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(window.title().to_string());
        Ok(())
    }

    async fn execute(&self, window: &WindowRef, action: &Action) -> Result<String, ActuatorError> {
        let target = self
            .find(window.descriptor())
            .filter(|w| w.is_alive())
            .ok_or_else(|| ActuatorError::WindowUnavailable(window.title().to_string()))?;

        if self.rejected.contains(&action.function) {
            return Err(ActuatorError::Rejected(action.function.clone()));
        }

        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action.clone());

        if matches!(action.function.as_str(), "close" | "close_window") {
            target.alive.store(false, Ordering::SeqCst);
        }
        tracing::debug!(window = %window.title(), function = %action.function, "dry-run action");
        Ok(format!("dry-run: {}", action.function))
    }

    async fn resolve(&self, descriptor: &WindowDescriptor) -> Option<WindowRef> {
        self.find(descriptor)
            .filter(|w| w.is_alive())
            .map(|w| WindowRef::live(w.clone()))
    }

    async fn capture_snapshot(&self, window: &WindowRef, path: &Path) -> Result<(), ActuatorError> {
        if !window.is_alive() {
            return Err(ActuatorError::WindowUnavailable(window.title().to_string()));
        }
        self.snapshots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.to_path_buf());
        Ok(())
    }
}
