//! 编排器：供外部前端（CLI/TUI）使用的 API 句柄
//!
//! 建立 cmd/state 两个通道：前端发 [`Command`]，后台任务持有引擎、按 tick 驱动并把
//! [`StatusReport`] 投影到 watch 通道。对外只有 start / pause / resume / status 四个核心操作，
//! 另加显式重试。

use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::engine::{new_session_id, Engine};
use super::error::OrchestratorError;
use super::state::{EnginePhase, StatusReport};
use crate::config::{load_config, AppConfig};
use crate::store::{KeySpace, SharedStore, StoreOptions};

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

/// 从前端发往编排器的命令
#[derive(Debug)]
pub enum Command {
    /// 规划目标并开始新会话，回复 session_id
    Start { goal: String, reply: Reply<String> },
    /// 写检查点并终止全部 Worker，回复 checkpoint_id
    Pause { reply: Reply<Option<String>> },
    /// 从检查点恢复，回复 session_id
    Resume { checkpoint_id: String, reply: Reply<String> },
    /// failed → pending
    Retry { task_id: String, reply: Reply<()> },
    /// 终止 Worker 并退出后台任务
    Quit,
}

/// 编排器句柄
pub struct Orchestrator {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state_rx: watch::Receiver<Option<StatusReport>>,
    join: JoinHandle<()>,
}

impl Orchestrator {
    /// 在后台任务中运行引擎
    pub fn spawn(cfg: AppConfig, store: SharedStore) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        let (state_tx, state_rx) = watch::channel(None);
        let join = tokio::spawn(drive(cfg, store, cmd_rx, state_tx));
        Self {
            cmd_tx,
            state_rx,
            join,
        }
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, OrchestratorError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply))
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    pub async fn start(&self, goal: impl Into<String>) -> Result<String, OrchestratorError> {
        let goal = goal.into();
        self.request(|reply| Command::Start { goal, reply }).await
    }

    pub async fn pause(&self) -> Result<Option<String>, OrchestratorError> {
        self.request(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self, checkpoint_id: impl Into<String>) -> Result<String, OrchestratorError> {
        let checkpoint_id = checkpoint_id.into();
        self.request(|reply| Command::Resume { checkpoint_id, reply }).await
    }

    pub async fn retry(&self, task_id: impl Into<String>) -> Result<(), OrchestratorError> {
        let task_id = task_id.into();
        self.request(|reply| Command::Retry { task_id, reply }).await
    }

    /// 最近一次投影的状态（尚未开始会话时为 None）
    pub fn status(&self) -> Option<StatusReport> {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StatusReport>> {
        self.state_rx.clone()
    }

    /// 等到当前会话结束、暂停或因致命错误停止
    pub async fn wait_until_settled(&self) -> Option<StatusReport> {
        let mut rx = self.state_rx.clone();
        let settled = rx
            .wait_for(|state| {
                state.as_ref().is_some_and(|r| {
                    matches!(
                        r.phase,
                        EnginePhase::Finished | EnginePhase::Paused | EnginePhase::Fatal
                    )
                })
            })
            .await
            .ok()?;
        settled.clone()
    }

    /// 终止 Worker 并等待后台任务结束
    pub async fn quit(self) {
        let _ = self.cmd_tx.send(Command::Quit);
        if let Err(e) = self.join.await {
            tracing::warn!("orchestrator task ended abnormally: {}", e);
        }
    }
}

/// 按配置打开存储并创建编排器；配置加载失败时退回默认值
pub async fn create_orchestrator(config_path: Option<PathBuf>) -> anyhow::Result<Orchestrator> {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let store = open_store(&cfg)?;
    Ok(Orchestrator::spawn(cfg, store))
}

/// 打开配置指定的存储文件（必要时创建目录）
pub fn open_store(cfg: &AppConfig) -> anyhow::Result<SharedStore> {
    use anyhow::Context;

    let path = cfg.store_path();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create store directory {}", parent.display()))?;
    }
    SharedStore::open(&path, StoreOptions::from(&cfg.store))
        .with_context(|| format!("failed to open store at {}", path.display()))
}

fn publish(state_tx: &watch::Sender<Option<StatusReport>>, engine: Option<&Engine>) {
    state_tx.send_replace(engine.map(Engine::status));
}

/// 当前引擎是否还占着会话（运行中且未结束）
fn occupied(engine: &Option<Engine>) -> Option<String> {
    engine
        .as_ref()
        .filter(|e| e.phase() == EnginePhase::Running)
        .map(|e| e.session_id().to_string())
}

async fn drive(
    cfg: AppConfig,
    store: SharedStore,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<Option<StatusReport>>,
) {
    let tick = cfg.engine_config().tick_interval;
    let mut engine: Option<Engine> = None;

    loop {
        let running = engine.as_ref().is_some_and(|e| e.phase() == EnginePhase::Running);
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Start { goal, reply }) => {
                    if let Some(session_id) = occupied(&engine) {
                        let _ = reply.send(Err(OrchestratorError::AlreadyStarted(session_id)));
                        continue;
                    }
                    let result = Engine::from_app_config(&cfg, store.clone(), new_session_id())
                        .and_then(|mut e| e.start(&goal).map(|_| e));
                    match result {
                        Ok(new_engine) => {
                            let session_id = new_engine.session_id().to_string();
                            engine = Some(new_engine);
                            let _ = reply.send(Ok(session_id));
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Some(Command::Pause { reply }) => {
                    let result = match engine.as_mut() {
                        Some(e) => e.pause().await,
                        None => Err(OrchestratorError::NotStarted),
                    };
                    let _ = reply.send(result);
                }
                Some(Command::Resume { checkpoint_id, reply }) => {
                    if let Some(session_id) = occupied(&engine) {
                        let _ = reply.send(Err(OrchestratorError::AlreadyStarted(session_id)));
                        continue;
                    }
                    let result = KeySpace::new(cfg.app.project_id.clone())
                        .map_err(OrchestratorError::from)
                        .and_then(|keys| {
                            Engine::resume(
                                store.clone(),
                                keys,
                                cfg.engine_config(),
                                cfg.worker_config(),
                                &checkpoint_id,
                            )
                        });
                    match result {
                        Ok(resumed) => {
                            let session_id = resumed.session_id().to_string();
                            engine = Some(resumed);
                            let _ = reply.send(Ok(session_id));
                        }
                        Err(e) => {
                            tracing::error!(checkpoint_id = %checkpoint_id, error = %e, "resume refused");
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                Some(Command::Retry { task_id, reply }) => {
                    let result = match engine.as_mut() {
                        Some(e) => e.retry(&task_id),
                        None => Err(OrchestratorError::NotStarted),
                    };
                    let _ = reply.send(result);
                }
                Some(Command::Quit) | None => {
                    if let Some(mut e) = engine.take() {
                        if let Err(err) = e.shutdown().await {
                            tracing::warn!(error = %err, "shutdown failed");
                        }
                        publish(&state_tx, Some(&e));
                    }
                    break;
                }
            },
            _ = tokio::time::sleep(tick), if running => {
                if let Some(e) = engine.as_mut() {
                    if e.supervisor().is_cancelled() {
                        if let Err(err) = e.pause().await {
                            tracing::warn!(error = %err, "pause after cancellation failed");
                        }
                    } else if let Err(err) = e.step().await {
                        if let Err(fatal) = e.on_error(err).await {
                            tracing::error!(error = %fatal, "engine stopped");
                        }
                    }
                }
            }
        }
        publish(&state_tx, engine.as_ref());
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config(script: &str) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.worker.command = "/bin/sh".into();
        cfg.worker.args = vec!["-c".into(), script.into(), "worker".into()];
        cfg.worker.grace_period_ms = 200;
        cfg.worker.spawn_check_ms = 20;
        cfg.engine.tick_interval_ms = 10;
        cfg
    }

    #[tokio::test]
    async fn test_start_runs_until_settled() {
        let store = SharedStore::open_in_memory().unwrap();
        let orchestrator = Orchestrator::spawn(config("exit 0"), store);
        assert!(orchestrator.status().is_none());

        let session_id = orchestrator.start("Implement X").await.unwrap();
        let report = orchestrator.wait_until_settled().await.unwrap();
        assert_eq!(report.session_id, session_id);
        assert_eq!(report.phase, EnginePhase::Finished);
        // 第一个任务没有完成标记即失败，后续任务被阻塞
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.tasks.len(), 3);
        assert!(report.tasks[1].reason.as_deref().unwrap().starts_with("Blocked"));

        orchestrator.quit().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume_through_commands() {
        let store = SharedStore::open_in_memory().unwrap();
        let orchestrator = Orchestrator::spawn(config("sleep 30"), store);
        assert!(matches!(
            orchestrator.pause().await,
            Err(OrchestratorError::NotStarted)
        ));

        let session_id = orchestrator.start("Tidy the docs").await.unwrap();
        assert!(matches!(
            orchestrator.start("again").await,
            Err(OrchestratorError::AlreadyStarted(_))
        ));
        let checkpoint_id = orchestrator.pause().await.unwrap().unwrap();

        let resumed = orchestrator.resume(checkpoint_id).await.unwrap();
        assert_eq!(resumed, session_id);
        orchestrator.quit().await;
    }
}
