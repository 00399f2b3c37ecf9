//! 编排引擎：单一控制循环驱动每个任务的状态机
//!
//! `pending → briefed → dispatched → completed | failed`。每个 tick：
//! 1. 整合已退出 Worker 的报告：见到完成标记则校验交付物，否则按退出/取消记为 failed
//! 2. 依赖全部完成的 pending 任务写出 Briefing，进入 briefed
//! 3. 按并发上限为 briefed 任务拉起 Worker，进入 dispatched
//!
//! 每个 Worker 的 stdout 由独立的后台任务读取并经 [`EventRouter`] 落盘，控制循环从不阻塞在
//! 单个 Worker 上。打印完成标记后超过 `post_marker_grace` 仍未退出的 Worker 会被终止，随后照常
//! 校验交付物。任务级失败只会让该任务停下；存储损坏是唯一让引擎退出的原因。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::{FailureKind, FailureReason, OrchestratorError};
use super::session_supervisor::{PauseReason, SessionSupervisor};
use super::state::{EnginePhase, LiveWorker, SessionMeta, StatusReport, TaskStatusRecord};
use super::task_scheduler::WorkerPool;
use crate::briefing::{build_briefing, issue_briefing, load_briefing, validate_briefing, BriefingContext};
use crate::config::{AppConfig, EngineConfig, WorkerConfig};
use crate::continuation::{ContinuationManager, ResumePlan, SessionSnapshot, WorkerProcessState};
use crate::monitor::{
    ExitInfo, MonitorEvent, ProcessMonitor, SpawnRequest, WorkerHandle, WorkerLauncher, WorkerStatus,
    WorkerTerminator,
};
use crate::planner::Planner;
use crate::store::{validate_segment, KeySpace, SharedStore, StoreError, Version, STORE_PATH_ENV};
use crate::stream::{EventKind, EventRouter, SequenceAllocator};
use crate::workflow::{Role, TaskGraph, TaskId, TaskStatus};

/// 终止请求发出后，额外等待监控任务上报的时间
const WORKER_EXIT_SLACK: Duration = Duration::from_secs(2);

/// 一次 tick 的统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub integrated: usize,
    pub briefed: usize,
    pub dispatched: usize,
}

/// 监控任务在 Worker 退出后发回的报告
#[derive(Debug)]
struct WorkerReport {
    task_id: TaskId,
    attempt: u32,
    exit: ExitInfo,
    saw_marker: bool,
    cancelled: bool,
    /// 打印完成标记后超过宽限期仍未退出，由引擎终止
    reaped_after_marker: bool,
    lines: usize,
    store_error: Option<StoreError>,
}

struct LiveEntry {
    attempt: u32,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    _permit: OwnedSemaphorePermit,
}

/// 新会话 id
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 编排引擎：拥有任务图与全部活跃 Worker
pub struct Engine {
    store: SharedStore,
    keys: KeySpace,
    session_id: String,
    goal: String,
    graph: Option<TaskGraph>,
    config: EngineConfig,
    worker: WorkerConfig,
    launcher: Arc<dyn WorkerLauncher>,
    pool: WorkerPool,
    router: EventRouter,
    supervisor: Arc<SessionSupervisor>,
    live: HashMap<TaskId, LiveEntry>,
    reports_tx: mpsc::UnboundedSender<WorkerReport>,
    reports_rx: mpsc::UnboundedReceiver<WorkerReport>,
    /// 状态记录待落盘的任务
    dirty: BTreeSet<TaskId>,
    phase: EnginePhase,
    created_at: DateTime<Utc>,
    resumed_from: Option<String>,
}

impl Engine {
    pub fn new(
        store: SharedStore,
        keys: KeySpace,
        session_id: impl Into<String>,
        config: EngineConfig,
        worker: WorkerConfig,
    ) -> Result<Self, OrchestratorError> {
        let session_id = session_id.into();
        validate_segment(&session_id)?;
        let sequences = SequenceAllocator::restore(&store, &keys, &session_id)?;
        let router = EventRouter::new(store.clone(), keys.clone(), session_id.clone(), sequences);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Ok(Self {
            launcher: Arc::new(ProcessMonitor::new(&worker)),
            pool: WorkerPool::new(config.max_concurrent_workers),
            store,
            keys,
            session_id,
            goal: String::new(),
            graph: None,
            config,
            worker,
            router,
            supervisor: Arc::new(SessionSupervisor::new()),
            live: HashMap::new(),
            reports_tx,
            reports_rx,
            dirty: BTreeSet::new(),
            phase: EnginePhase::Idle,
            created_at: Utc::now(),
            resumed_from: None,
        })
    }

    /// 按应用配置创建引擎（项目 id、引擎与 Worker 参数）
    pub fn from_app_config(
        cfg: &AppConfig,
        store: SharedStore,
        session_id: impl Into<String>,
    ) -> Result<Self, OrchestratorError> {
        let keys = KeySpace::new(cfg.app.project_id.clone())?;
        Self::new(store, keys, session_id, cfg.engine_config(), cfg.worker_config())
    }

    /// 替换 Worker 启动器
    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// 由恢复计划创建新一代引擎；旧的 Worker 进程从不重新接管
    pub fn from_resume(
        store: SharedStore,
        keys: KeySpace,
        config: EngineConfig,
        worker: WorkerConfig,
        plan: ResumePlan,
    ) -> Result<Self, OrchestratorError> {
        let mut engine = Self::new(store, keys, plan.session_id.clone(), config, worker)?;
        engine.router.sequences().advance_to(plan.next_sequence_no);
        if let Ok(meta) = engine
            .store
            .read_as::<SessionMeta>(&engine.keys.session_meta(&plan.session_id))
        {
            engine.created_at = meta.created_at;
        }
        engine.resumed_from = Some(plan.checkpoint_id.clone());
        engine.start_with_graph(&plan.goal, plan.graph)?;
        tracing::info!(
            session_id = %engine.session_id,
            checkpoint_id = %plan.checkpoint_id,
            reconciled = plan.decisions.len(),
            "session resumed"
        );
        Ok(engine)
    }

    /// 读取检查点、对账并创建新引擎
    pub fn resume(
        store: SharedStore,
        keys: KeySpace,
        config: EngineConfig,
        worker: WorkerConfig,
        checkpoint_id: &str,
    ) -> Result<Self, OrchestratorError> {
        let plan = ContinuationManager::new(store.clone(), keys.clone()).resume(checkpoint_id)?;
        Self::from_resume(store, keys, config, worker, plan)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn phase(&self) -> EnginePhase {
        self.phase
    }

    pub fn graph(&self) -> Option<&TaskGraph> {
        self.graph.as_ref()
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn supervisor(&self) -> Arc<SessionSupervisor> {
        Arc::clone(&self.supervisor)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// 规划目标并持久化初始状态
    pub fn start(&mut self, goal: &str) -> Result<(), OrchestratorError> {
        if self.graph.is_some() {
            return Err(OrchestratorError::AlreadyStarted(self.session_id.clone()));
        }
        let graph = Planner::new().plan(&self.session_id, goal)?;
        self.start_with_graph(goal, graph)
    }

    /// 以给定任务图启动（任务图一旦给定其结构不再改变）
    pub fn start_with_graph(&mut self, goal: &str, graph: TaskGraph) -> Result<(), OrchestratorError> {
        if self.graph.is_some() {
            return Err(OrchestratorError::AlreadyStarted(self.session_id.clone()));
        }
        self.dirty.extend(graph.ids().map(String::from));
        self.goal = goal.trim().to_string();
        self.graph = Some(graph);
        self.phase = EnginePhase::Running;
        self.write_session_meta()?;
        self.flush_status()?;
        tracing::info!(
            session_id = %self.session_id,
            tasks = self.graph.as_ref().map(TaskGraph::len).unwrap_or(0),
            "session started"
        );
        Ok(())
    }

    /// 驱动到没有可推进的工作，或收到暂停请求
    pub async fn run(&mut self) -> Result<StatusReport, OrchestratorError> {
        if self.graph.is_none() {
            return Err(OrchestratorError::NotStarted);
        }
        let span = tracing::info_span!("engine", session_id = %self.session_id);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&mut self) -> Result<StatusReport, OrchestratorError> {
        let token = self.supervisor.cancel_token();
        self.phase = EnginePhase::Running;
        loop {
            if token.is_cancelled() {
                // 外部暂停（Ctrl+C / SIGTERM）：先写检查点，再回收 Worker
                match self.pause().await {
                    Ok(checkpoint_id) => {
                        tracing::info!(checkpoint_id = ?checkpoint_id, "run interrupted")
                    }
                    Err(e) => self.on_error(e).await?,
                }
                break;
            }

            if let Err(e) = self.tick().await {
                self.on_error(e).await?;
            }

            if self.is_idle()? {
                self.finish()?;
                break;
            }

            tokio::select! {
                Some(report) = self.reports_rx.recv() => {
                    if let Err(e) = self.integrate(report) {
                        self.on_error(e).await?;
                    }
                }
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = token.cancelled() => {}
            }
        }
        Ok(self.status())
    }

    /// tick 一次并在没有可推进的工作时收尾；返回本代引擎是否已结束
    ///
    /// 供外部驱动循环（如 [`super::orchestrator::Orchestrator`]）使用。
    pub async fn step(&mut self) -> Result<bool, OrchestratorError> {
        self.tick().await?;
        if self.phase == EnginePhase::Running && self.is_idle()? {
            self.finish()?;
        }
        Ok(self.phase == EnginePhase::Finished)
    }

    fn finish(&mut self) -> Result<(), OrchestratorError> {
        self.phase = EnginePhase::Finished;
        self.write_session_meta()?;
        let report = self.status();
        tracing::info!(
            session_id = %self.session_id,
            completed = report.count(TaskStatus::Completed),
            failed = report.failed.len(),
            "session finished"
        );
        Ok(())
    }

    /// 非致命错误记日志后继续；致命错误回收 Worker 并返回
    pub(crate) async fn on_error(&mut self, err: OrchestratorError) -> Result<(), OrchestratorError> {
        if !err.is_fatal() {
            tracing::warn!(error = %err, "engine step failed, continuing");
            return Ok(());
        }
        tracing::error!(error = %err, "fatal error, stopping engine");
        self.phase = EnginePhase::Fatal;
        self.supervisor.request_pause(PauseReason::Requested).await;
        if let Err(cleanup) = self.drain_workers().await {
            tracing::warn!(error = %cleanup, "worker cleanup after fatal error failed");
        }
        Err(err)
    }

    fn is_idle(&self) -> Result<bool, OrchestratorError> {
        let graph = self.graph.as_ref().ok_or(OrchestratorError::NotStarted)?;
        Ok(!graph.has_runnable_work() && self.live.is_empty())
    }

    /// 单步：整合报告 → 写 Briefing → 派发
    pub async fn tick(&mut self) -> Result<TickSummary, OrchestratorError> {
        if self.graph.is_none() {
            return Err(OrchestratorError::NotStarted);
        }
        let mut summary = TickSummary::default();
        while let Ok(report) = self.reports_rx.try_recv() {
            self.integrate(report)?;
            summary.integrated += 1;
        }
        if !self.supervisor.is_cancelled() {
            summary.briefed = self.brief_ready()?;
            summary.dispatched = self.dispatch_briefed().await?;
        }
        self.flush_status()?;
        if summary != TickSummary::default() {
            tracing::debug!(
                integrated = summary.integrated,
                briefed = summary.briefed,
                dispatched = summary.dispatched,
                live = self.live.len(),
                "tick"
            );
        }
        Ok(summary)
    }

    fn graph_ref(&self) -> Result<&TaskGraph, OrchestratorError> {
        self.graph.as_ref().ok_or(OrchestratorError::NotStarted)
    }

    fn graph_mut(&mut self) -> Result<&mut TaskGraph, OrchestratorError> {
        self.graph.as_mut().ok_or(OrchestratorError::NotStarted)
    }

    fn brief_ready(&mut self) -> Result<usize, OrchestratorError> {
        let ready = self.graph_ref()?.ready_tasks();
        let mut briefed = 0;
        for task_id in ready {
            match self.ensure_briefing(&task_id) {
                Ok(()) => {
                    self.graph_mut()?.advance(&task_id, TaskStatus::Briefed)?;
                    self.dirty.insert(task_id.clone());
                    briefed += 1;
                    tracing::info!(task_id = %task_id, "task briefed");
                }
                Err(OrchestratorError::Store(e)) if !e.is_fatal() => {
                    let reason = FailureReason::new(FailureKind::StoreWriteError, e.to_string());
                    self.fail_task(&task_id, reason)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(briefed)
    }

    /// 已有 Briefing（重试、恢复）直接复用；Briefing 只创建不覆盖
    fn ensure_briefing(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let graph = self.graph_ref()?;
        let task = graph
            .get(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if let Some(existing) = load_briefing(&self.store, &self.keys, task_id)? {
            if existing.role_required == task.role {
                return Ok(());
            }
            return Err(StoreError::AlreadyExists(self.keys.briefing(task_id)).into());
        }
        let ctx = BriefingContext {
            store: &self.store,
            keys: &self.keys,
            session_id: &self.session_id,
            graph,
            max_pointers: self.config.max_context_pointers,
        };
        let briefing = build_briefing(task, &ctx)?;
        issue_briefing(&self.store, &self.keys, &briefing)?;
        Ok(())
    }

    async fn dispatch_briefed(&mut self) -> Result<usize, OrchestratorError> {
        let briefed = self.graph_ref()?.briefed_tasks();
        let mut dispatched = 0;
        for task_id in briefed {
            if self.live.contains_key(&task_id) {
                return Err(OrchestratorError::DoubleDispatch(task_id));
            }
            let Some(permit) = self.pool.try_acquire() else {
                break;
            };
            let (role, attempt) = {
                let task = self
                    .graph_ref()?
                    .get(&task_id)
                    .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.clone()))?;
                (task.role, task.attempt)
            };
            let request = self.spawn_request(&task_id, role);
            match self.launcher.launch(request).await {
                Ok(handle) => {
                    self.track(task_id, attempt, handle, permit)?;
                    dispatched += 1;
                }
                Err(source) => {
                    let err = OrchestratorError::Spawn {
                        task_id: task_id.clone(),
                        source,
                    };
                    tracing::warn!(error = %err, "worker spawn failed");
                    let reason = err
                        .failure_reason()
                        .unwrap_or_else(|| FailureReason::new(FailureKind::SpawnError, err.to_string()));
                    self.fail_task(&task_id, reason)?;
                }
            }
        }
        Ok(dispatched)
    }

    /// 固定的最小命令行：只有角色与 Briefing 键；存储位置经环境变量传递
    fn spawn_request(&self, task_id: &str, role: Role) -> SpawnRequest {
        let mut request = SpawnRequest::new(self.worker.command.clone())
            .args(self.worker.args.iter().cloned())
            .arg("--role")
            .arg(role.as_str())
            .arg("--briefing")
            .arg(self.keys.briefing(task_id));
        for (key, value) in &self.worker.env {
            request = request.env(key.clone(), value.clone());
        }
        request.env(STORE_PATH_ENV, self.store.path().display().to_string())
    }

    fn track(
        &mut self,
        task_id: TaskId,
        attempt: u32,
        handle: WorkerHandle,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), OrchestratorError> {
        self.graph_mut()?.advance(&task_id, TaskStatus::Dispatched)?;
        self.dirty.insert(task_id.clone());

        let pid = handle.pid();
        let started_at = handle.started_at();
        let dispatched = self.router.event(
            &task_id,
            EventKind::Lifecycle,
            json!({"phase": "dispatched", "source": "engine", "pid": pid, "attempt": attempt}),
        );
        if let Err(e) = self.router.route(&dispatched) {
            if e.is_fatal() {
                return Err(e.into());
            }
            tracing::warn!(task_id = %task_id, error = %e, "failed to record dispatch event");
        }

        let cancel = self.supervisor.child_token();
        let span = tracing::info_span!("worker", task_id = %task_id, pid = ?pid, attempt);
        let join = tokio::spawn(
            watch_worker(WorkerWatch {
                task_id: task_id.clone(),
                attempt,
                handle,
                router: self.router.clone(),
                cancel: cancel.clone(),
                grace: self.launcher.grace_period(),
                post_marker_grace: self.worker.post_marker_grace,
                reports: self.reports_tx.clone(),
            })
            .instrument(span),
        );
        tracing::info!(task_id = %task_id, pid = ?pid, attempt, "worker dispatched");
        self.live.insert(
            task_id,
            LiveEntry {
                attempt,
                pid,
                started_at,
                cancel,
                join,
                _permit: permit,
            },
        );
        Ok(())
    }

    /// 处理一份退出报告：完成标记 + 交付物有效才算完成
    fn integrate(&mut self, report: WorkerReport) -> Result<(), OrchestratorError> {
        let WorkerReport {
            task_id,
            attempt,
            exit,
            saw_marker,
            cancelled,
            reaped_after_marker,
            lines,
            store_error,
        } = report;
        match self.live.get(&task_id) {
            Some(entry) if entry.attempt == attempt => {}
            _ => {
                tracing::debug!(task_id = %task_id, attempt, "stale worker report ignored");
                return Ok(());
            }
        }
        // 移除即归还并发槽位
        self.live.remove(&task_id);
        tracing::info!(
            task_id = %task_id,
            exit = %exit,
            marker = saw_marker,
            cancelled,
            reaped_after_marker,
            lines,
            "worker exited"
        );
        if let Some(e) = store_error {
            if e.is_fatal() {
                return Err(e.into());
            }
        }
        if self.graph_ref()?.status(&task_id) != Some(TaskStatus::Dispatched) {
            return Ok(());
        }

        if saw_marker {
            if !exit.success && !reaped_after_marker {
                tracing::warn!(task_id = %task_id, exit = %exit, "worker exited non-zero after terminal marker");
            }
            match self.check_deliverables(&task_id)? {
                None => self.complete_task(&task_id),
                Some(reason) => self.fail_task(&task_id, reason),
            }
        } else if cancelled {
            self.fail_task(&task_id, FailureReason::cancelled())
        } else {
            let err = OrchestratorError::ProcessTerminatedUnexpectedly {
                task_id: task_id.clone(),
                detail: format!("worker exited ({}) without terminal marker", exit),
            };
            let reason = err.failure_reason().unwrap_or_else(|| {
                FailureReason::new(FailureKind::ProcessTerminatedUnexpectedly, err.to_string())
            });
            self.fail_task(&task_id, reason)
        }
    }

    /// None 表示全部 required 交付物通过
    fn check_deliverables(&self, task_id: &str) -> Result<Option<FailureReason>, OrchestratorError> {
        let Some(briefing) = load_briefing(&self.store, &self.keys, task_id)? else {
            return Ok(Some(FailureReason::new(
                FailureKind::DeliverableValidationError,
                format!("briefing for {} is missing", task_id),
            )));
        };
        let failures = validate_briefing(&self.store, &briefing)?;
        if failures.is_empty() {
            return Ok(None);
        }
        for failure in &failures {
            let err = OrchestratorError::DeliverableValidation {
                task_id: task_id.to_string(),
                source: failure.clone(),
            };
            tracing::warn!(key = failure.key(), error = %err, "deliverable rejected");
        }
        let detail = failures
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Ok(Some(FailureReason::new(FailureKind::DeliverableValidationError, detail)))
    }

    fn complete_task(&mut self, task_id: &str) -> Result<(), OrchestratorError> {
        self.graph_mut()?.advance(task_id, TaskStatus::Completed)?;
        self.dirty.insert(task_id.to_string());
        tracing::info!(task_id = %task_id, "task completed");
        Ok(())
    }

    fn fail_task(&mut self, task_id: &str, reason: FailureReason) -> Result<(), OrchestratorError> {
        tracing::warn!(task_id = %task_id, reason = %reason, "task failed");
        let graph = self.graph_mut()?;
        graph.fail(task_id, reason)?;
        let blocked = graph.dependents(task_id);
        if !blocked.is_empty() {
            tracing::info!(task_id = %task_id, blocked = ?blocked, "dependents blocked");
        }
        self.dirty.insert(task_id.to_string());
        Ok(())
    }

    /// 显式重试：failed → pending（唯一的回退路径）
    pub fn retry(&mut self, task_id: &str) -> Result<(), OrchestratorError> {
        self.graph_mut()?.retry(task_id)?;
        self.dirty.insert(task_id.to_string());
        if self.phase == EnginePhase::Finished {
            self.phase = EnginePhase::Running;
        }
        self.flush_status()?;
        tracing::info!(task_id = %task_id, "task reset for retry");
        Ok(())
    }

    /// 当前状态投影
    pub fn status(&self) -> StatusReport {
        let live_workers = self.live_workers();
        match &self.graph {
            Some(graph) => StatusReport::project(&self.session_id, &self.goal, self.phase, graph, live_workers),
            None => StatusReport {
                session_id: self.session_id.clone(),
                goal: self.goal.clone(),
                phase: self.phase,
                tasks: Vec::new(),
                live_workers,
                finished: false,
                failed: Vec::new(),
            },
        }
    }

    fn live_workers(&self) -> Vec<LiveWorker> {
        let mut workers: Vec<LiveWorker> = self
            .live
            .iter()
            .map(|(task_id, entry)| LiveWorker {
                task_id: task_id.clone(),
                pid: entry.pid,
                started_at: entry.started_at,
                attempt: entry.attempt,
            })
            .collect();
        workers.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        workers
    }

    /// 交给续跑管理器的快照
    pub fn snapshot(&self) -> Result<SessionSnapshot, OrchestratorError> {
        let graph = self.graph_ref()?;
        let workers = self
            .live_workers()
            .into_iter()
            .map(|w| WorkerProcessState {
                task_id: w.task_id,
                pid: w.pid,
                started_at: w.started_at,
                attempt: w.attempt,
                status: WorkerStatus::Running,
                last_event_offset: None,
            })
            .collect();
        Ok(SessionSnapshot {
            session_id: self.session_id.clone(),
            goal: self.goal.clone(),
            tasks: graph.snapshot(),
            workers,
            next_sequence_no: self.router.sequences().peek(),
        })
    }

    pub fn checkpoint(&mut self) -> Result<String, OrchestratorError> {
        // 先让存储里的状态记录与内存一致
        self.flush_status()?;
        let snapshot = self.snapshot()?;
        let checkpoint = ContinuationManager::new(self.store.clone(), self.keys.clone()).checkpoint(&snapshot)?;
        Ok(checkpoint.checkpoint_id)
    }

    /// 暂停：写检查点（按配置），再终止全部 Worker；被终止的任务记为 cancelled
    pub async fn pause(&mut self) -> Result<Option<String>, OrchestratorError> {
        if self.graph.is_none() {
            return Err(OrchestratorError::NotStarted);
        }
        let checkpoint = if self.config.checkpoint_on_pause {
            Some(self.checkpoint())
        } else {
            None
        };
        self.supervisor.request_pause(PauseReason::Requested).await;
        self.drain_workers().await?;
        self.phase = EnginePhase::Paused;
        self.write_session_meta()?;
        self.flush_status()?;
        let checkpoint_id = checkpoint.transpose()?;
        let pause_reason = self.supervisor.pause_reason().await;
        tracing::info!(
            session_id = %self.session_id,
            checkpoint_id = ?checkpoint_id,
            reason = ?pause_reason.map(|r| r.as_str()),
            "session paused"
        );
        Ok(checkpoint_id)
    }

    /// 终止全部 Worker 并结束本代引擎（不写检查点）
    pub async fn shutdown(&mut self) -> Result<StatusReport, OrchestratorError> {
        self.supervisor.request_pause(PauseReason::Requested).await;
        self.drain_workers().await?;
        if let Some(graph) = &self.graph {
            self.phase = if graph.has_runnable_work() {
                EnginePhase::Paused
            } else {
                EnginePhase::Finished
            };
            self.write_session_meta()?;
            self.flush_status()?;
        }
        tracing::info!(session_id = %self.session_id, "engine shut down");
        Ok(self.status())
    }

    /// 取消全部 Worker 并等待其报告
    async fn drain_workers(&mut self) -> Result<(), OrchestratorError> {
        for entry in self.live.values() {
            entry.cancel.cancel();
        }
        let deadline = self.launcher.grace_period() + WORKER_EXIT_SLACK;
        while !self.live.is_empty() {
            match tokio::time::timeout(deadline, self.reports_rx.recv()).await {
                Ok(Some(report)) => self.integrate(report)?,
                Ok(None) => break,
                Err(_) => {
                    let stuck: Vec<TaskId> = self.live.keys().cloned().collect();
                    for task_id in stuck {
                        if let Some(entry) = self.live.remove(&task_id) {
                            tracing::warn!(task_id = %task_id, "worker monitor did not report, aborting");
                            entry.join.abort();
                        }
                        if self.graph_ref()?.status(&task_id) == Some(TaskStatus::Dispatched) {
                            self.fail_task(&task_id, FailureReason::cancelled())?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// 引擎写入统一经过这里：拒绝任何落在 Worker 产出空间的键
    fn engine_write(&self, key: &str, value: &Value) -> Result<Version, OrchestratorError> {
        if self.keys.is_output_key(key) {
            return Err(OrchestratorError::OutputSpaceWrite(key.to_string()));
        }
        Ok(self.store.write(key, value)?)
    }

    fn write_session_meta(&self) -> Result<(), OrchestratorError> {
        let meta = SessionMeta {
            session_id: self.session_id.clone(),
            project_id: self.keys.project_id().to_string(),
            goal: self.goal.clone(),
            task_ids: self
                .graph
                .as_ref()
                .map(|g| g.ids().map(String::from).collect())
                .unwrap_or_default(),
            phase: self.phase,
            created_at: self.created_at,
            resumed_from: self.resumed_from.clone(),
        };
        let value = serde_json::to_value(&meta).map_err(StoreError::from)?;
        self.engine_write(&self.keys.session_meta(&self.session_id), &value)?;
        Ok(())
    }

    /// 把变更过的任务状态记录在一个事务内写出
    fn flush_status(&mut self) -> Result<(), OrchestratorError> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        let graph = self.graph_ref()?;
        let mut entries = Vec::with_capacity(self.dirty.len());
        for task_id in &self.dirty {
            let Some(task) = graph.get(task_id) else {
                continue;
            };
            let key = self.keys.status(task_id);
            if self.keys.is_output_key(&key) {
                return Err(OrchestratorError::OutputSpaceWrite(key));
            }
            let record = TaskStatusRecord::from_task(&self.session_id, task);
            entries.push((key, serde_json::to_value(&record).map_err(StoreError::from)?));
        }
        self.store.write_batch(&entries)?;
        self.dirty.clear();
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // 监控任务收到取消后会终止各自的子进程
        for entry in self.live.values() {
            entry.cancel.cancel();
        }
    }
}

struct WorkerWatch {
    task_id: TaskId,
    attempt: u32,
    handle: WorkerHandle,
    router: EventRouter,
    cancel: CancellationToken,
    grace: Duration,
    post_marker_grace: Duration,
    reports: mpsc::UnboundedSender<WorkerReport>,
}

fn spawn_terminate(terminator: WorkerTerminator, grace: Duration) {
    // 继续读完剩余输出，退出事件照常到达
    tokio::spawn(async move {
        if let Err(e) = terminator.terminate(grace).await {
            tracing::warn!(error = %e, "terminate failed");
        }
    });
}

/// 每个 Worker 一个：读行 → 打标 → 落盘，直到进程退出
async fn watch_worker(watch: WorkerWatch) {
    let WorkerWatch {
        task_id,
        attempt,
        mut handle,
        router,
        cancel,
        grace,
        post_marker_grace,
        reports,
    } = watch;
    let terminator = handle.terminator();
    let mut report = WorkerReport {
        task_id: task_id.clone(),
        attempt,
        exit: ExitInfo::unknown(),
        saw_marker: false,
        cancelled: false,
        reaped_after_marker: false,
        lines: 0,
        store_error: None,
    };

    let mut marker_deadline: Option<Instant> = None;
    let mut stopping = false;
    loop {
        tokio::select! {
            event = handle.next_event() => match event {
                Some(MonitorEvent::Line(line)) => {
                    report.lines += 1;
                    let event = router.stamp(&task_id, &line);
                    if event.kind == EventKind::Terminal {
                        report.saw_marker = true;
                        marker_deadline.get_or_insert_with(|| Instant::now() + post_marker_grace);
                    }
                    if let Err(e) = router.route(&event) {
                        tracing::warn!(error = %e, "failed to persist worker event");
                        report.store_error.get_or_insert(e);
                    }
                }
                Some(MonitorEvent::Exited(exit)) => {
                    report.exit = exit;
                    break;
                }
                None => break,
            },
            _ = cancel.cancelled(), if !stopping => {
                report.cancelled = true;
                stopping = true;
                spawn_terminate(terminator.clone(), grace);
            }
            _ = tokio::time::sleep_until(marker_deadline.unwrap_or_else(Instant::now)),
                if marker_deadline.is_some() && !stopping =>
            {
                stopping = true;
                report.reaped_after_marker = true;
                tracing::warn!(
                    grace_ms = post_marker_grace.as_millis() as u64,
                    "worker still running after terminal marker, terminating"
                );
                spawn_terminate(terminator.clone(), grace);
            }
        }
    }

    let exited = router.event(
        &task_id,
        EventKind::Lifecycle,
        json!({
            "phase": "exited",
            "source": "engine",
            "code": report.exit.code,
            "signal": report.exit.signal,
            "marker_seen": report.saw_marker,
            "cancelled": report.cancelled,
            "reaped_after_marker": report.reaped_after_marker,
        }),
    );
    if let Err(e) = router.route(&exited) {
        tracing::warn!(error = %e, "failed to record exit event");
        report.store_error.get_or_insert(e);
    }
    let _ = reports.send(report);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::store::StoreOptions;
    use crate::stream::EventLog;
    use crate::workflow::TaskGraphBuilder;

    fn engine_with(script: &str, store: SharedStore) -> Engine {
        let keys = KeySpace::new("p").unwrap();
        let worker = WorkerConfig {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into(), "worker".into()],
            grace_period: Duration::from_millis(300),
            spawn_check: Duration::from_millis(50),
            ..WorkerConfig::default()
        };
        let config = EngineConfig {
            tick_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        Engine::new(store, keys, "s1", config, worker).unwrap()
    }

    fn single_task() -> TaskGraph {
        TaskGraphBuilder::new()
            .task("t1", Role::Analyst, "Analyze")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_exit_zero_without_marker_fails() {
        let store = SharedStore::open_in_memory().unwrap();
        let mut engine = engine_with("echo working; sleep 0.1; exit 0", store);
        engine.start_with_graph("g", single_task()).unwrap();

        let report = engine.run().await.unwrap();
        let line = report.task("t1").unwrap();
        assert_eq!(line.status, TaskStatus::Failed);
        assert!(line.reason.as_deref().unwrap().starts_with("ProcessTerminatedUnexpectedly"));
        assert!(report.finished);
        assert_eq!(engine.live_count(), 0);
    }

    #[tokio::test]
    async fn test_marker_without_deliverables_fails_validation() {
        let store = SharedStore::open_in_memory().unwrap();
        let mut engine = engine_with("sleep 0.1; echo '[[HIVE:TASK_COMPLETE]]'", store);
        engine.start_with_graph("g", single_task()).unwrap();

        let report = engine.run().await.unwrap();
        let line = report.task("t1").unwrap();
        assert_eq!(line.status, TaskStatus::Failed);
        assert!(line.reason.as_deref().unwrap().starts_with("DeliverableValidationError"));
    }

    #[tokio::test]
    async fn test_fast_output_burst_keeps_terminal_marker() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(dir.path().join("store.db"), StoreOptions::default()).unwrap();
        let mut engine = engine_with(
            "seq 1 20000; echo '[[HIVE:TASK_COMPLETE]]'; exit 0",
            store.clone(),
        );
        engine.start_with_graph("g", single_task()).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(120), engine.run())
            .await
            .unwrap()
            .unwrap();
        // 见到了标记，失败原因只可能来自交付物校验
        let line = report.task("t1").unwrap();
        assert_eq!(line.status, TaskStatus::Failed);
        assert!(line.reason.as_deref().unwrap().starts_with("DeliverableValidationError"));

        let events = EventLog::new(store, engine.keys().clone()).for_task("s1", "t1").unwrap();
        let count = |kind: EventKind| events.iter().filter(|e| e.kind == kind).count();
        assert_eq!(count(EventKind::Terminal), 1);
        assert_eq!(count(EventKind::ParseError), 20000);
        assert_eq!(events.len(), 20000 + 1 + 2);
    }

    #[tokio::test]
    async fn test_worker_lingering_after_marker_is_terminated() {
        let store = SharedStore::open_in_memory().unwrap();
        let mut engine = engine_with("echo '[[HIVE:TASK_COMPLETE]]'; sleep 30", store.clone());
        engine.worker.post_marker_grace = Duration::from_millis(200);
        engine.start_with_graph("g", single_task()).unwrap();

        let started = std::time::Instant::now();
        let report = tokio::time::timeout(Duration::from_secs(5), engine.run())
            .await
            .expect("run should settle once the lingering worker is reaped")
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
        let line = report.task("t1").unwrap();
        assert_eq!(line.status, TaskStatus::Failed);
        assert!(line.reason.as_deref().unwrap().starts_with("DeliverableValidationError"));
        assert_eq!(engine.live_count(), 0);

        let events = EventLog::new(store, engine.keys().clone()).for_task("s1", "t1").unwrap();
        let exited = events
            .iter()
            .find(|e| e.payload.get("phase").and_then(Value::as_str) == Some("exited"))
            .unwrap();
        assert_eq!(exited.payload["marker_seen"], json!(true));
        assert_eq!(exited.payload["reaped_after_marker"], json!(true));
        assert_eq!(exited.payload["cancelled"], json!(false));
    }

    #[tokio::test]
    async fn test_missing_worker_binary_is_spawn_error() {
        let store = SharedStore::open_in_memory().unwrap();
        let mut engine = engine_with("true", store);
        engine.worker.command = "/definitely/not/a/worker".into();
        engine.launcher = Arc::new(ProcessMonitor::new(&engine.worker));
        engine.start_with_graph("g", single_task()).unwrap();

        let report = engine.run().await.unwrap();
        let line = report.task("t1").unwrap();
        assert_eq!(line.status, TaskStatus::Failed);
        assert!(line.reason.as_deref().unwrap().starts_with("SpawnError"));
    }

    #[tokio::test]
    async fn test_status_records_and_events_are_persisted() {
        let store = SharedStore::open_in_memory().unwrap();
        let mut engine = engine_with("echo '{\"type\":\"lifecycle\",\"phase\":\"started\"}'; sleep 0.1", store.clone());
        engine.start_with_graph("g", single_task()).unwrap();
        engine.run().await.unwrap();

        let record: TaskStatusRecord = store.read_as(&engine.keys().status("t1")).unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        let meta: SessionMeta = store.read_as(&engine.keys().session_meta("s1")).unwrap();
        assert_eq!(meta.phase, EnginePhase::Finished);

        let events = EventLog::new(store, engine.keys().clone()).for_task("s1", "t1").unwrap();
        let phases: Vec<_> = events
            .iter()
            .filter_map(|e| e.payload.get("phase").and_then(|p| p.as_str()))
            .collect();
        assert_eq!(phases, vec!["dispatched", "started", "exited"]);
        assert!(events.windows(2).all(|w| w[0].sequence_no < w[1].sequence_no));
    }

    #[tokio::test]
    async fn test_pause_cancels_live_workers() {
        let store = SharedStore::open_in_memory().unwrap();
        let mut engine = engine_with("sleep 30", store);
        engine.start_with_graph("g", single_task()).unwrap();
        engine.tick().await.unwrap();
        assert_eq!(engine.live_count(), 1);

        let checkpoint_id = engine.pause().await.unwrap();
        assert!(checkpoint_id.is_some());
        let report = engine.status();
        assert_eq!(report.phase, EnginePhase::Paused);
        let line = report.task("t1").unwrap();
        assert_eq!(line.status, TaskStatus::Failed);
        assert_eq!(line.reason.as_deref(), Some("cancelled: terminated by supervisor"));
        assert!(report.live_workers.is_empty());
    }

    #[tokio::test]
    async fn test_retry_resets_failed_task_and_engine_rejects_double_start() {
        let store = SharedStore::open_in_memory().unwrap();
        let mut engine = engine_with("exit 0", store);
        engine.start_with_graph("g", single_task()).unwrap();
        assert!(matches!(
            engine.start("again"),
            Err(OrchestratorError::AlreadyStarted(_))
        ));
        engine.run().await.unwrap();
        assert_eq!(engine.status().task("t1").unwrap().status, TaskStatus::Failed);

        engine.retry("t1").unwrap();
        let line = engine.status().task("t1").cloned().unwrap();
        assert_eq!(line.status, TaskStatus::Pending);
        assert_eq!(line.attempt, 1);
        assert!(engine.retry("t1").is_err());
    }
}
