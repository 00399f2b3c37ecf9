//! 状态定义：持久化的任务状态记录、会话元信息与 StatusReport 投影
//!
//! 引擎内部持有完整的 TaskGraph 与活跃 Worker 表；对外（CLI、Orchestrator 的 watch 通道）
//! 只给出轻量的 [`StatusReport`]。同一份投影也能脱离引擎、直接从存储中的状态记录重建。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{KeySpace, SharedStore, StoreError};
use crate::workflow::{FailureKind, FailureReason, Role, Task, TaskGraph, TaskId, TaskStatus};

/// 引擎阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePhase {
    Idle,
    Running,
    Paused,
    Finished,
    Fatal,
}

impl EnginePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnginePhase::Idle => "idle",
            EnginePhase::Running => "running",
            EnginePhase::Paused => "paused",
            EnginePhase::Finished => "finished",
            EnginePhase::Fatal => "fatal",
        }
    }
}

/// `/projects/{p}/tasks/status/{task_id}` 下的记录；只有引擎写
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub task_id: TaskId,
    pub session_id: String,
    pub role: Role,
    pub status: TaskStatus,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<TaskId>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatusRecord {
    pub fn from_task(session_id: &str, task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            session_id: session_id.to_string(),
            role: task.role,
            status: task.status,
            attempt: task.attempt,
            failure: task.failure.clone(),
            depends_on: task.depends_on.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// `/projects/{p}/sessions/{s}/meta`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub project_id: String,
    pub goal: String,
    pub task_ids: Vec<TaskId>,
    pub phase: EnginePhase,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
}

/// 单个任务在报告中的一行
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusLine {
    pub task_id: TaskId,
    pub role: Role,
    pub status: TaskStatus,
    pub attempt: u32,
    /// failed 的记录原因；被阻塞的 pending 任务给出 Blocked 说明
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<TaskId>,
}

/// 活跃 Worker 描述
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveWorker {
    pub task_id: TaskId,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub attempt: u32,
}

/// status() 的返回值
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub session_id: String,
    pub goal: String,
    pub phase: EnginePhase,
    pub tasks: Vec<TaskStatusLine>,
    pub live_workers: Vec<LiveWorker>,
    /// 没有任何可推进的工作且没有活跃 Worker
    pub finished: bool,
    /// (task_id, reason) for every failed task
    pub failed: Vec<(TaskId, String)>,
}

impl StatusReport {
    /// 从内存中的任务图投影
    pub fn project(
        session_id: &str,
        goal: &str,
        phase: EnginePhase,
        graph: &TaskGraph,
        live_workers: Vec<LiveWorker>,
    ) -> Self {
        let tasks: Vec<TaskStatusLine> = graph
            .tasks()
            .iter()
            .map(|task| {
                let blocked_by = graph.blocked_by(&task.id);
                let reason = match (&task.failure, blocked_by.is_empty()) {
                    (Some(failure), _) => Some(failure.to_string()),
                    (None, false) => Some(
                        FailureReason::new(
                            FailureKind::Blocked,
                            format!("waiting on failed {}", blocked_by.join(", ")),
                        )
                        .to_string(),
                    ),
                    (None, true) => None,
                };
                TaskStatusLine {
                    task_id: task.id.clone(),
                    role: task.role,
                    status: task.status,
                    attempt: task.attempt,
                    reason,
                    blocked_by,
                }
            })
            .collect();
        let failed = failed_lines(&tasks);
        let finished = !graph.has_runnable_work() && live_workers.is_empty();
        Self {
            session_id: session_id.to_string(),
            goal: goal.to_string(),
            phase,
            tasks,
            live_workers,
            finished,
            failed,
        }
    }

    /// 不依赖运行中的引擎，直接读取会话元信息与状态记录
    pub fn load(store: &SharedStore, keys: &KeySpace, session_id: &str) -> Result<Self, StoreError> {
        let meta: SessionMeta = store.read_as(&keys.session_meta(session_id))?;
        let status_keys: Vec<String> = meta.task_ids.iter().map(|t| keys.status(t)).collect();
        let mut tasks = Vec::with_capacity(status_keys.len());
        for (key, value) in store.read_many(&status_keys)? {
            let record: TaskStatusRecord =
                serde_json::from_value(value).map_err(|e| StoreError::InvalidValue {
                    key,
                    reason: e.to_string(),
                })?;
            let mut task = Task::new(record.task_id, record.role, String::new());
            task.status = record.status;
            task.attempt = record.attempt;
            task.failure = record.failure;
            task.depends_on = record.depends_on;
            tasks.push(task);
        }
        // 状态记录来自外部存储，依赖缺失时退化为不带依赖的视图
        let graph = match TaskGraph::from_tasks(tasks.clone()) {
            Ok(graph) => graph,
            Err(_) => TaskGraph::from_tasks(
                tasks
                    .into_iter()
                    .map(|mut t| {
                        t.depends_on.clear();
                        t
                    })
                    .collect(),
            )
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        };
        Ok(Self::project(session_id, &meta.goal, meta.phase, &graph, Vec::new()))
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskStatusLine> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

fn failed_lines(tasks: &[TaskStatusLine]) -> Vec<(TaskId, String)> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .map(|t| (t.task_id.clone(), t.reason.clone().unwrap_or_default()))
        .collect()
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "session {} [{}]", self.session_id, self.phase.as_str())?;
        writeln!(f, "goal: {}", self.goal)?;
        for line in &self.tasks {
            write!(f, "  {:<28} {:<12} {:<10}", line.task_id, line.role, line.status)?;
            if let Some(reason) = &line.reason {
                write!(f, " {}", reason)?;
            }
            writeln!(f)?;
        }
        for worker in &self.live_workers {
            writeln!(
                f,
                "  worker {} pid={} since {}",
                worker.task_id,
                worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                worker.started_at.to_rfc3339()
            )?;
        }
        if self.finished {
            write!(f, "finished: {} failed", self.failed.len())?;
        } else {
            write!(f, "in progress: {} live worker(s)", self.live_workers.len())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::TaskGraphBuilder;

    fn graph() -> TaskGraph {
        TaskGraphBuilder::new()
            .task("a", Role::Analyst, "Analyze")
            .task("b", Role::Implementer, "Implement")
            .task("c", Role::Reviewer, "Review")
            .chain()
            .build()
            .unwrap()
    }

    #[test]
    fn test_failed_tasks_carry_reason_and_block_dependents() {
        let mut g = graph();
        g.advance("a", TaskStatus::Briefed).unwrap();
        g.advance("a", TaskStatus::Dispatched).unwrap();
        g.fail(
            "a",
            FailureReason::new(FailureKind::ProcessTerminatedUnexpectedly, "exit 0 without marker"),
        )
        .unwrap();

        let report = StatusReport::project("s1", "goal", EnginePhase::Running, &g, Vec::new());
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].1.starts_with("ProcessTerminatedUnexpectedly"));
        let b = report.task("b").unwrap();
        assert_eq!(b.status, TaskStatus::Pending);
        assert_eq!(b.blocked_by, vec!["a".to_string()]);
        assert!(b.reason.as_deref().unwrap().starts_with("Blocked"));
        assert!(report.finished);
        assert!(report.to_string().contains("ProcessTerminatedUnexpectedly"));
    }

    #[test]
    fn test_load_from_store_records() {
        let store = SharedStore::open_in_memory().unwrap();
        let keys = KeySpace::new("p").unwrap();
        let mut g = graph();
        g.advance("a", TaskStatus::Briefed).unwrap();
        let meta = SessionMeta {
            session_id: "s1".into(),
            project_id: "p".into(),
            goal: "tidy".into(),
            task_ids: g.ids().map(String::from).collect(),
            phase: EnginePhase::Paused,
            created_at: Utc::now(),
            resumed_from: None,
        };
        store.write_as(&keys.session_meta("s1"), &meta).unwrap();
        for task in g.tasks() {
            store
                .write_as(&keys.status(&task.id), &TaskStatusRecord::from_task("s1", task))
                .unwrap();
        }

        let report = StatusReport::load(&store, &keys, "s1").unwrap();
        assert_eq!(report.phase, EnginePhase::Paused);
        assert_eq!(report.task("a").unwrap().status, TaskStatus::Briefed);
        assert_eq!(report.count(TaskStatus::Pending), 2);
        assert!(!report.finished);
    }
}
