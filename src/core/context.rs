//! 会话上下文：同一会话内所有 Round / 智能体共享的类型化键值存储
//!
//! 键是封闭枚举 ContextKey，每个键声明自己的值类型；写入类型不符时返回 ContextError::TypeMismatch。
//! 只由运行会话的工作任务修改。

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::actuator::{WindowDescriptor, WindowRef};
use crate::core::ContextError;
use crate::observability::SessionLogs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextKey {
    Id,
    Mode,
    LogPath,
    Request,
    /// round id -> 该轮步数
    RoundStep,
    SessionStep,
    CurrentRoundId,
    ApplicationWindow,
    /// 当前应用窗口标题
    ApplicationProcessName,
    /// 当前应用可执行文件名
    ApplicationRootName,
    SessionCost,
    /// round id -> 该轮成本
    RoundCost,
    Logger,
}

impl ContextKey {
    pub const ALL: [ContextKey; 13] = [
        ContextKey::Id,
        ContextKey::Mode,
        ContextKey::LogPath,
        ContextKey::Request,
        ContextKey::RoundStep,
        ContextKey::SessionStep,
        ContextKey::CurrentRoundId,
        ContextKey::ApplicationWindow,
        ContextKey::ApplicationProcessName,
        ContextKey::ApplicationRootName,
        ContextKey::SessionCost,
        ContextKey::RoundCost,
        ContextKey::Logger,
    ];

    pub fn kind(&self) -> ValueKind {
        match self {
            ContextKey::Id
            | ContextKey::Mode
            | ContextKey::LogPath
            | ContextKey::Request
            | ContextKey::ApplicationProcessName
            | ContextKey::ApplicationRootName => ValueKind::Text,
            ContextKey::SessionStep | ContextKey::CurrentRoundId => ValueKind::Int,
            ContextKey::SessionCost => ValueKind::Float,
            ContextKey::RoundStep => ValueKind::IntMap,
            ContextKey::RoundCost => ValueKind::FloatMap,
            ContextKey::ApplicationWindow => ValueKind::Window,
            ContextKey::Logger => ValueKind::Logger,
        }
    }

    fn default_value(&self) -> ContextValue {
        match self.kind() {
            ValueKind::Text => ContextValue::Text(String::new()),
            ValueKind::Int => ContextValue::Int(0),
            ValueKind::Float => ContextValue::Float(0.0),
            ValueKind::IntMap => ContextValue::IntMap(BTreeMap::new()),
            ValueKind::FloatMap => ContextValue::FloatMap(BTreeMap::new()),
            ValueKind::Window => ContextValue::Window(None),
            ValueKind::Logger => ContextValue::Logger(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueKind {
    Text,
    Int,
    Float,
    IntMap,
    FloatMap,
    Window,
    Logger,
}

#[derive(Debug, Clone)]
pub enum ContextValue {
    Text(String),
    Int(u64),
    Float(f64),
    IntMap(BTreeMap<u32, u64>),
    FloatMap(BTreeMap<u32, f64>),
    Window(Option<WindowRef>),
    Logger(Option<Arc<SessionLogs>>),
}

impl ContextValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            ContextValue::Text(_) => ValueKind::Text,
            ContextValue::Int(_) => ValueKind::Int,
            ContextValue::Float(_) => ValueKind::Float,
            ContextValue::IntMap(_) => ValueKind::IntMap,
            ContextValue::FloatMap(_) => ValueKind::FloatMap,
            ContextValue::Window(_) => ValueKind::Window,
            ContextValue::Logger(_) => ValueKind::Logger,
        }
    }
}

/// 可序列化的上下文副本（窗口只保留描述符，不含日志句柄）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub mode: String,
    pub log_path: String,
    pub request: String,
    pub round_step: BTreeMap<u32, u64>,
    pub session_step: u64,
    pub current_round_id: u64,
    pub window: Option<WindowDescriptor>,
    pub process_name: String,
    pub root_name: String,
    pub session_cost: f64,
    pub round_cost: BTreeMap<u32, f64>,
}

#[derive(Debug, Clone)]
pub struct Context {
    values: HashMap<ContextKey, ContextValue>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// 所有键以其类型的零值初始化
    pub fn new() -> Self {
        Self {
            values: ContextKey::ALL
                .iter()
                .map(|key| (*key, key.default_value()))
                .collect(),
        }
    }

    pub fn set(&mut self, key: ContextKey, value: ContextValue) -> Result<(), ContextError> {
        if key.kind() != value.kind() {
            return Err(ContextError::TypeMismatch {
                key,
                expected: key.kind(),
                actual: value.kind(),
            });
        }
        self.values.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: ContextKey) -> Option<&ContextValue> {
        self.values.get(&key)
    }

    pub fn set_text(&mut self, key: ContextKey, text: impl Into<String>) -> Result<(), ContextError> {
        self.set(key, ContextValue::Text(text.into()))
    }

    /// 文本值；键不是文本类型时返回空串
    pub fn text(&self, key: ContextKey) -> &str {
        match self.values.get(&key) {
            Some(ContextValue::Text(s)) => s.as_str(),
            _ => "",
        }
    }

    fn int(&self, key: ContextKey) -> u64 {
        match self.values.get(&key) {
            Some(ContextValue::Int(v)) => *v,
            _ => 0,
        }
    }

    fn float(&self, key: ContextKey) -> f64 {
        match self.values.get(&key) {
            Some(ContextValue::Float(v)) => *v,
            _ => 0.0,
        }
    }

    fn int_map_mut(&mut self, key: ContextKey) -> Option<&mut BTreeMap<u32, u64>> {
        match self.values.get_mut(&key) {
            Some(ContextValue::IntMap(map)) => Some(map),
            _ => None,
        }
    }

    fn float_map_mut(&mut self, key: ContextKey) -> Option<&mut BTreeMap<u32, f64>> {
        match self.values.get_mut(&key) {
            Some(ContextValue::FloatMap(map)) => Some(map),
            _ => None,
        }
    }

    pub fn session_step(&self) -> u64 {
        self.int(ContextKey::SessionStep)
    }

    pub fn session_cost(&self) -> f64 {
        self.float(ContextKey::SessionCost)
    }

    pub fn current_round_id(&self) -> u32 {
        self.int(ContextKey::CurrentRoundId) as u32
    }

    pub fn round_step(&self, round_id: u32) -> u64 {
        match self.values.get(&ContextKey::RoundStep) {
            Some(ContextValue::IntMap(map)) => map.get(&round_id).copied().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn round_cost(&self, round_id: u32) -> f64 {
        match self.values.get(&ContextKey::RoundCost) {
            Some(ContextValue::FloatMap(map)) => map.get(&round_id).copied().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    pub fn current_round_step(&self) -> u64 {
        self.round_step(self.current_round_id())
    }

    pub fn current_round_cost(&self) -> f64 {
        self.round_cost(self.current_round_id())
    }

    /// 新一轮开始：设置当前 round id，并把该轮计数初始化为 0（已存在则保留）
    pub fn start_round(&mut self, round_id: u32) {
        self.values
            .insert(ContextKey::CurrentRoundId, ContextValue::Int(round_id as u64));
        if let Some(map) = self.int_map_mut(ContextKey::RoundStep) {
            map.entry(round_id).or_insert(0);
        }
        if let Some(map) = self.float_map_mut(ContextKey::RoundCost) {
            map.entry(round_id).or_insert(0.0);
        }
    }

    /// 记一步：当前轮与会话步数各加 1，成本（不可用视为 0）累加到两处
    pub fn record_step(&mut self, cost: Option<f64>) {
        let round_id = self.current_round_id();
        let cost = cost.unwrap_or(0.0);
        if let Some(map) = self.int_map_mut(ContextKey::RoundStep) {
            *map.entry(round_id).or_insert(0) += 1;
        }
        self.add_cost(cost);
        let step = self.session_step() + 1;
        self.values
            .insert(ContextKey::SessionStep, ContextValue::Int(step));
    }

    /// 不计步的成本（如评估）
    pub fn add_cost(&mut self, cost: f64) {
        if cost <= 0.0 {
            return;
        }
        let round_id = self.current_round_id();
        if let Some(map) = self.float_map_mut(ContextKey::RoundCost) {
            *map.entry(round_id).or_insert(0.0) += cost;
        }
        let total = self.session_cost() + cost;
        self.values
            .insert(ContextKey::SessionCost, ContextValue::Float(total));
    }

    pub fn window(&self) -> Option<&WindowRef> {
        match self.values.get(&ContextKey::ApplicationWindow) {
            Some(ContextValue::Window(window)) => window.as_ref(),
            _ => None,
        }
    }

    pub fn window_mut(&mut self) -> Option<&mut WindowRef> {
        match self.values.get_mut(&ContextKey::ApplicationWindow) {
            Some(ContextValue::Window(window)) => window.as_mut(),
            _ => None,
        }
    }

    /// 切换当前应用：窗口、标题、可执行文件名一起更新
    pub fn set_application(&mut self, window: WindowRef) {
        let title = window.descriptor().title.clone();
        let root = window.descriptor().process_name.clone();
        self.values
            .insert(ContextKey::ApplicationWindow, ContextValue::Window(Some(window)));
        self.values
            .insert(ContextKey::ApplicationProcessName, ContextValue::Text(title));
        self.values
            .insert(ContextKey::ApplicationRootName, ContextValue::Text(root));
    }

    pub fn logs(&self) -> Option<Arc<SessionLogs>> {
        match self.values.get(&ContextKey::Logger) {
            Some(ContextValue::Logger(logs)) => logs.clone(),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> ContextSnapshot {
        let round_step = match self.values.get(&ContextKey::RoundStep) {
            Some(ContextValue::IntMap(map)) => map.clone(),
            _ => BTreeMap::new(),
        };
        let round_cost = match self.values.get(&ContextKey::RoundCost) {
            Some(ContextValue::FloatMap(map)) => map.clone(),
            _ => BTreeMap::new(),
        };
        ContextSnapshot {
            id: self.text(ContextKey::Id).to_string(),
            mode: self.text(ContextKey::Mode).to_string(),
            log_path: self.text(ContextKey::LogPath).to_string(),
            request: self.text(ContextKey::Request).to_string(),
            round_step,
            session_step: self.session_step(),
            current_round_id: self.int(ContextKey::CurrentRoundId),
            window: self.window().map(|w| w.descriptor().clone()),
            process_name: self.text(ContextKey::ApplicationProcessName).to_string(),
            root_name: self.text(ContextKey::ApplicationRootName).to_string(),
            session_cost: self.session_cost(),
            round_cost,
        }
    }

    /// 从快照恢复：窗口未解析，日志句柄由调用方重新挂上
    pub fn restore(snapshot: &ContextSnapshot) -> Self {
        let mut ctx = Self::new();
        let entries = [
            (ContextKey::Id, ContextValue::Text(snapshot.id.clone())),
            (ContextKey::Mode, ContextValue::Text(snapshot.mode.clone())),
            (ContextKey::LogPath, ContextValue::Text(snapshot.log_path.clone())),
            (ContextKey::Request, ContextValue::Text(snapshot.request.clone())),
            (ContextKey::RoundStep, ContextValue::IntMap(snapshot.round_step.clone())),
            (ContextKey::SessionStep, ContextValue::Int(snapshot.session_step)),
            (ContextKey::CurrentRoundId, ContextValue::Int(snapshot.current_round_id)),
            (
                ContextKey::ApplicationWindow,
                ContextValue::Window(snapshot.window.clone().map(WindowRef::unresolved)),
            ),
            (
                ContextKey::ApplicationProcessName,
                ContextValue::Text(snapshot.process_name.clone()),
            ),
            (
                ContextKey::ApplicationRootName,
                ContextValue::Text(snapshot.root_name.clone()),
            ),
            (ContextKey::SessionCost, ContextValue::Float(snapshot.session_cost)),
            (ContextKey::RoundCost, ContextValue::FloatMap(snapshot.round_cost.clone())),
        ];
        for (key, value) in entries {
            ctx.values.insert(key, value);
        }
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_is_rejected() {
        let mut ctx = Context::new();
        let err = ctx
            .set(ContextKey::SessionStep, ContextValue::Text("three".into()))
            .unwrap_err();
        assert_eq!(
            err,
            ContextError::TypeMismatch {
                key: ContextKey::SessionStep,
                expected: ValueKind::Int,
                actual: ValueKind::Text,
            }
        );
        assert_eq!(ctx.session_step(), 0);
        assert!(ctx.set_text(ContextKey::Request, "close Notepad").is_ok());
        assert_eq!(ctx.text(ContextKey::Request), "close Notepad");
    }

    #[test]
    fn test_record_step_is_per_round_and_cumulative() {
        let mut ctx = Context::new();
        ctx.start_round(0);
        ctx.record_step(Some(0.5));
        ctx.record_step(None);
        ctx.start_round(1);
        ctx.record_step(Some(0.25));

        assert_eq!(ctx.round_step(0), 2);
        assert_eq!(ctx.current_round_step(), 1);
        assert_eq!(ctx.session_step(), 3);
        assert_eq!(ctx.round_cost(0), 0.5);
        assert_eq!(ctx.session_cost(), 0.75);
    }

    #[test]
    fn test_snapshot_drops_live_handles() {
        let mut ctx = Context::new();
        ctx.start_round(0);
        ctx.record_step(Some(1.0));
        ctx.set_application(WindowRef::unresolved(WindowDescriptor {
            process_id: 7,
            title: "Untitled - Notepad".into(),
            class_name: "notepad".into(),
            process_name: "notepad.exe".into(),
        }));

        let snapshot = ctx.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let back: ContextSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);

        let restored = Context::restore(&back);
        assert_eq!(restored.session_step(), 1);
        assert_eq!(restored.text(ContextKey::ApplicationRootName), "notepad.exe");
        let window = restored.window().unwrap();
        assert!(!window.is_resolved());
        assert!(restored.logs().is_none());
    }
}
