//! 可观测性：tracing 初始化与会话 JSONL 日志
//!
//! 每个会话在 logs/<task>/ 下写三个追加式日志：response.log（每步决策）、request.log（每轮请求）、
//! evaluation.log（评估结果）。每行一个 JSON 对象，带 timestamp 字段。

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化全局 subscriber：默认 info，可通过 RUST_LOG 覆盖
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

pub const RESPONSE_LOG: &str = "response.log";
pub const REQUEST_LOG: &str = "request.log";
pub const EVALUATION_LOG: &str = "evaluation.log";

/// 会话日志 sink
#[derive(Debug)]
pub struct SessionLogs {
    dir: PathBuf,
    response: Mutex<File>,
    request: Mutex<File>,
    evaluation: Mutex<File>,
}

impl SessionLogs {
    /// 创建目录并以追加方式打开三个日志文件
    pub fn create(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let open = |name: &str| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join(name))
        };
        Ok(Self {
            response: Mutex::new(open(RESPONSE_LOG)?),
            request: Mutex::new(open(REQUEST_LOG)?),
            evaluation: Mutex::new(open(EVALUATION_LOG)?),
            dir,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_response(&self, entry: serde_json::Value) {
        Self::append(&self.response, RESPONSE_LOG, entry);
    }

    pub fn log_request(&self, entry: serde_json::Value) {
        Self::append(&self.request, REQUEST_LOG, entry);
    }

    pub fn log_evaluation(&self, entry: serde_json::Value) {
        Self::append(&self.evaluation, EVALUATION_LOG, entry);
    }

    /// 写失败只告警，不影响会话
    fn append(sink: &Mutex<File>, name: &str, mut entry: serde_json::Value) {
        if let Some(obj) = entry.as_object_mut() {
            obj.insert(
                "timestamp".to_string(),
                serde_json::Value::String(chrono::Local::now().to_rfc3339()),
            );
        }
        let mut file = sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{}", entry) {
            tracing::warn!(log = name, error = %e, "failed to append session log");
        }
    }
}

/// 读取 JSONL 文件；文件不存在时返回空，坏行跳过
pub fn read_jsonl(path: impl AsRef<Path>) -> std::io::Result<Vec<serde_json::Value>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(value) => entries.push(value),
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "skipping malformed log line"),
        }
    }
    Ok(entries)
}
