//! 任务图类型定义
//!
//! 任务、角色、状态机与失败原因

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type TaskId = String;

/// Worker 角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Coordinator,
    Researcher,
    Analyst,
    Implementer,
    Debugger,
    Tester,
    Reviewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Coordinator => "coordinator",
            Role::Researcher => "researcher",
            Role::Analyst => "analyst",
            Role::Implementer => "implementer",
            Role::Debugger => "debugger",
            Role::Tester => "tester",
            Role::Reviewer => "reviewer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinator" => Some(Role::Coordinator),
            "researcher" => Some(Role::Researcher),
            "analyst" => Some(Role::Analyst),
            "implementer" => Some(Role::Implementer),
            "debugger" => Some(Role::Debugger),
            "tester" => Some(Role::Tester),
            "reviewer" => Some(Role::Reviewer),
            _ => None,
        }
    }

    /// 验证类角色需要看到整条上游链路的产出，而不仅是直接依赖
    pub fn needs_transitive_context(&self) -> bool {
        matches!(self, Role::Tester | Role::Reviewer)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态：只能前进；failed → pending 只能由显式 retry 触发
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 等待依赖满足
    Pending,
    /// Briefing 已写入，等待并发槽位
    Briefed,
    /// Worker 已启动
    Dispatched,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Briefed => "briefed",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 运行期允许的转移（不含 retry）
    pub fn can_advance_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Briefed)
                | (Briefed, Dispatched)
                | (Dispatched, Completed)
                | (Dispatched, Failed)
                // 依赖失败或启动前出错
                | (Pending, Failed)
                | (Briefed, Failed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    SpawnError,
    DeliverableValidationError,
    ProcessTerminatedUnexpectedly,
    Cancelled,
    Blocked,
    StoreWriteError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SpawnError => "SpawnError",
            FailureKind::DeliverableValidationError => "DeliverableValidationError",
            FailureKind::ProcessTerminatedUnexpectedly => "ProcessTerminatedUnexpectedly",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Blocked => "Blocked",
            FailureKind::StoreWriteError => "StoreWriteError",
        }
    }
}

/// 任务失败的记录原因（用户可见）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(FailureKind::Cancelled, "terminated by supervisor")
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

/// 任务节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub role: Role,
    pub description: String,
    /// 数值越小越先调度
    pub priority: u32,
    pub status: TaskStatus,
    pub depends_on: Vec<TaskId>,
    #[serde(with = "duration_secs")]
    pub estimated_duration: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// 第几次尝试（retry 递增）
    #[serde(default)]
    pub attempt: u32,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, role: Role, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            description: description.into(),
            priority: 0,
            status: TaskStatus::Pending,
            depends_on: Vec::new(),
            estimated_duration: Duration::from_secs(300),
            failure: None,
            attempt: 0,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration = estimate;
        self
    }

    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// 任务图错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),
    #[error("Duplicate task id: {0}")]
    DuplicateTask(TaskId),
    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: TaskId, dependency: TaskId },
    #[error("Cyclic dependency detected involving {0}")]
    CyclicDependency(TaskId),
    #[error("Invalid transition for {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    #[error("Task {task} cannot be dispatched: dependency {dependency} is not completed")]
    DependencyNotCompleted { task: TaskId, dependency: TaskId },
    #[error("Invalid task graph: {0}")]
    InvalidConfiguration(String),
}
