//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__ENGINE__MAX_CONCURRENT_WORKERS=4`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub watch: WatchSection,
}

/// [app] 段：项目 id、数据目录
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    #[serde(default = "default_project_id")]
    pub project_id: String,
    /// 存储文件等落盘数据的根目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            project_id: default_project_id(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_project_id() -> String {
    "default".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".hive")
}

/// [store] 段：存储文件与容量上限
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// 未设置时为 `<data_dir>/store.db`
    pub path: Option<PathBuf>,
    #[serde(default = "default_max_value_bytes")]
    pub max_value_bytes: usize,
    /// 存储文件增长上限，超过后写入以 StoreFull 失败
    #[serde(default = "default_max_store_bytes")]
    pub max_store_bytes: u64,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: None,
            max_value_bytes: default_max_value_bytes(),
            max_store_bytes: default_max_store_bytes(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_max_value_bytes() -> usize {
    1024 * 1024
}

fn default_max_store_bytes() -> u64 {
    256 * 1024 * 1024
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// [engine] 段：并发上限、tick 间隔、context pointer 上限
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    /// 同时处于 dispatched 的任务数上限
    #[serde(default = "default_max_concurrent_workers")]
    pub max_concurrent_workers: usize,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// 单个 Briefing 最多携带的 context pointer 数
    #[serde(default = "default_max_context_pointers")]
    pub max_context_pointers: usize,
    /// pause 时是否先写 checkpoint
    #[serde(default = "default_checkpoint_on_pause")]
    pub checkpoint_on_pause: bool,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_workers: default_max_concurrent_workers(),
            tick_interval_ms: default_tick_interval_ms(),
            max_context_pointers: default_max_context_pointers(),
            checkpoint_on_pause: default_checkpoint_on_pause(),
        }
    }
}

fn default_max_concurrent_workers() -> usize {
    2
}

fn default_tick_interval_ms() -> u64 {
    50
}

fn default_max_context_pointers() -> usize {
    16
}

fn default_checkpoint_on_pause() -> bool {
    true
}

/// [worker] 段：Worker 可执行文件与进程控制参数
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_command")]
    pub command: String,
    /// 固定的前置参数（在 --role / --briefing 之前）
    #[serde(default)]
    pub args: Vec<String>,
    /// 传给每个 Worker 的环境变量
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// terminate 时 SIGTERM 到强杀之间的宽限期
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// 启动后在该窗口内以非零码退出视为 SpawnError
    #[serde(default = "default_spawn_check_ms")]
    pub spawn_check_ms: u64,
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
    /// stdout 单行上限，超出部分拆成后续行
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
    /// 打印完成标记后仍未退出的 Worker，等待这么久后被终止
    #[serde(default = "default_post_marker_grace_ms")]
    pub post_marker_grace_ms: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
            env: HashMap::new(),
            grace_period_ms: default_grace_period_ms(),
            spawn_check_ms: default_spawn_check_ms(),
            stderr_tail_lines: default_stderr_tail_lines(),
            max_line_bytes: default_max_line_bytes(),
            post_marker_grace_ms: default_post_marker_grace_ms(),
        }
    }
}

fn default_worker_command() -> String {
    "hive-worker".to_string()
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_spawn_check_ms() -> u64 {
    100
}

fn default_stderr_tail_lines() -> usize {
    20
}

fn default_max_line_bytes() -> usize {
    256 * 1024
}

fn default_post_marker_grace_ms() -> u64 {
    2000
}

/// [watch] 段：轮询间隔与退避上限
#[derive(Debug, Clone, Deserialize)]
pub struct WatchSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    1600
}

impl AppConfig {
    /// 存储文件路径：[store].path 优先，否则 `<data_dir>/store.db`
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| self.app.data_dir.join("store.db"))
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::from(&self.engine)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::from(&self.worker)
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig::from(&self.watch)
    }
}

/// 引擎运行参数（由 [engine] 段投影而来）
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_workers: usize,
    pub tick_interval: Duration,
    pub max_context_pointers: usize,
    pub checkpoint_on_pause: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(s: &EngineSection) -> Self {
        Self {
            max_concurrent_workers: s.max_concurrent_workers.max(1),
            tick_interval: Duration::from_millis(s.tick_interval_ms.max(1)),
            max_context_pointers: s.max_context_pointers,
            checkpoint_on_pause: s.checkpoint_on_pause,
        }
    }
}

/// Worker 启动与终止参数
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub grace_period: Duration,
    pub spawn_check: Duration,
    pub stderr_tail_lines: usize,
    pub max_line_bytes: usize,
    pub post_marker_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::from(&WorkerSection::default())
    }
}

impl From<&WorkerSection> for WorkerConfig {
    fn from(s: &WorkerSection) -> Self {
        Self {
            command: s.command.clone(),
            args: s.args.clone(),
            env: s.env.clone(),
            grace_period: Duration::from_millis(s.grace_period_ms),
            spawn_check: Duration::from_millis(s.spawn_check_ms),
            stderr_tail_lines: s.stderr_tail_lines,
            max_line_bytes: s.max_line_bytes,
            post_marker_grace: Duration::from_millis(s.post_marker_grace_ms),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub poll_interval: Duration,
    pub max_backoff: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::from(&WatchSection::default())
    }
}

impl From<&WatchSection> for WatchConfig {
    fn from(s: &WatchSection) -> Self {
        Self {
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app.project_id, "default");
        assert_eq!(cfg.engine.max_concurrent_workers, 2);
        assert_eq!(cfg.store_path(), PathBuf::from(".hive/store.db"));
        assert_eq!(cfg.worker_config().grace_period, Duration::from_millis(3000));
        assert_eq!(cfg.engine_config().tick_interval, Duration::from_millis(50));
        assert_eq!(cfg.worker_config().post_marker_grace, Duration::from_millis(2000));
        assert_eq!(cfg.worker_config().max_line_bytes, 256 * 1024);
    }

    #[test]
    fn test_reload_reads_shipped_defaults() {
        let cfg = reload_config().unwrap();
        assert_eq!(cfg.worker.max_line_bytes, 262144);
        assert_eq!(cfg.worker.post_marker_grace_ms, 2000);
        assert_eq!(cfg.watch.max_backoff_ms, 1600);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[app]
project_id = "acme"

[engine]
max_concurrent_workers = 4

[worker]
command = "/usr/local/bin/acme-worker"
args = ["--verbose"]

[worker.env]
ACME_MODE = "ci"
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.app.project_id, "acme");
        assert_eq!(cfg.engine.max_concurrent_workers, 4);
        assert_eq!(cfg.engine.tick_interval_ms, 50);
        assert_eq!(cfg.worker.args, vec!["--verbose".to_string()]);
        assert_eq!(cfg.worker.env.get("ACME_MODE").map(String::as_str), Some("ci"));
    }
}
