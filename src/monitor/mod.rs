//! 进程监控：以固定的最小命令行拉起 Worker 子进程，采集其 stdout 行流与退出信号
//!
//! - `spawn`：二进制不存在、无法启动、或在 spawn_check 窗口内以非零码退出，均返回 [`MonitorError`]
//! - 每个 Worker 都有独立的后台读取任务，多个 Worker 之间互不阻塞
//! - 进程退出（含崩溃）作为 [`MonitorEvent::Exited`] 单独上报，与 Worker 自己输出的完成标记无关

pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use process::{ExitInfo, MonitorEvent, WorkerHandle, WorkerStatus, WorkerTerminator};

use crate::config::WorkerConfig;

/// 启动与监控 Worker 时的错误（SpawnError 族 + IO）
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Worker binary not found: {command}")]
    BinaryNotFound { command: String },

    #[error("Failed to launch worker '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Worker exited immediately with code {code:?}: {stderr}")]
    ExitedImmediately { code: Option<i32>, stderr: String },

    #[error("Worker IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MonitorError {
    /// 是否属于 SpawnError（对该任务致命，对引擎无害）
    pub fn is_spawn_error(&self) -> bool {
        !matches!(self, MonitorError::Io(_))
    }
}

/// 一次启动请求
#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub current_dir: Option<PathBuf>,
}

impl SpawnRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// 进程监控器：持有启动检查窗口、宽限期、stderr 尾部长度与单行上限
#[derive(Debug, Clone)]
pub struct ProcessMonitor {
    spawn_check: Duration,
    grace_period: Duration,
    stderr_tail_lines: usize,
    max_line_bytes: usize,
}

impl Default for ProcessMonitor {
    fn default() -> Self {
        Self::new(&WorkerConfig::default())
    }
}

impl ProcessMonitor {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            spawn_check: config.spawn_check,
            grace_period: config.grace_period,
            stderr_tail_lines: config.stderr_tail_lines.max(1),
            max_line_bytes: config.max_line_bytes.max(1),
        }
    }

    /// 拉起子进程并开始采集输出
    pub async fn spawn(&self, request: SpawnRequest) -> Result<WorkerHandle, MonitorError> {
        process::spawn(request, self.spawn_check, self.stderr_tail_lines, self.max_line_bytes).await
    }
}

/// Worker 启动器：引擎只依赖该接口，默认实现为本地子进程
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, request: SpawnRequest) -> Result<WorkerHandle, MonitorError>;

    /// 终止时的默认宽限期
    fn grace_period(&self) -> Duration;
}

#[async_trait]
impl WorkerLauncher for ProcessMonitor {
    async fn launch(&self, request: SpawnRequest) -> Result<WorkerHandle, MonitorError> {
        self.spawn(request).await
    }

    fn grace_period(&self) -> Duration {
        self.grace_period
    }
}
