//! 编排层错误
//!
//! 任务级失败（SpawnError、DeliverableValidationError、ProcessTerminatedUnexpectedly、cancelled）
//! 只会让该任务进入 failed，并以 [`FailureReason`] 记录；只有存储损坏与检查点损坏会让引擎停下。

use thiserror::Error;

use crate::briefing::DeliverableValidationError;
use crate::monitor::MonitorError;
use crate::store::StoreError;
use crate::workflow::{GraphError, TaskStatus};

pub use crate::workflow::{FailureKind, FailureReason};

/// 引擎与续跑管理器对外的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Spawn error for task {task_id}: {source}")]
    Spawn {
        task_id: String,
        #[source]
        source: MonitorError,
    },

    #[error("Deliverable validation failed for task {task_id}: {source}")]
    DeliverableValidation {
        task_id: String,
        #[source]
        source: DeliverableValidationError,
    },

    #[error("Worker for task {task_id} terminated unexpectedly: {detail}")]
    ProcessTerminatedUnexpectedly { task_id: String, detail: String },

    #[error("Checkpoint {checkpoint_id} is corrupt: {reason}")]
    CheckpointCorrupt { checkpoint_id: String, reason: String },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {0} already has a live worker")]
    DoubleDispatch(String),

    #[error("Session mismatch: expected {expected}, found {found}")]
    SessionMismatch { expected: String, found: String },

    #[error("Task graph error: {0}")]
    Graph(GraphError),

    #[error("Refusing engine write into worker output space: {0}")]
    OutputSpaceWrite(String),

    #[error("Engine has not been started")]
    NotStarted,

    #[error("Engine already started for session {0}")]
    AlreadyStarted(String),

    #[error("Orchestrator stopped")]
    Stopped,
}

impl From<GraphError> for OrchestratorError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::TaskNotFound(id) => OrchestratorError::TaskNotFound(id),
            GraphError::InvalidTransition { task, from, to } => {
                OrchestratorError::InvalidTransition { task, from, to }
            }
            other => OrchestratorError::Graph(other),
        }
    }
}

impl OrchestratorError {
    pub fn corrupt_checkpoint(checkpoint_id: impl Into<String>, reason: impl Into<String>) -> Self {
        OrchestratorError::CheckpointCorrupt {
            checkpoint_id: checkpoint_id.into(),
            reason: reason.into(),
        }
    }

    /// 引擎无法安全继续：存储损坏/写满、检查点损坏
    pub fn is_fatal(&self) -> bool {
        match self {
            OrchestratorError::Store(e) => e.is_fatal(),
            OrchestratorError::CheckpointCorrupt { .. } => true,
            _ => false,
        }
    }

    /// 映射为持久化到任务上的失败原因（仅任务级错误有意义）
    pub fn failure_reason(&self) -> Option<FailureReason> {
        let reason = match self {
            OrchestratorError::Spawn { source, .. } => {
                FailureReason::new(FailureKind::SpawnError, source.to_string())
            }
            OrchestratorError::DeliverableValidation { source, .. } => {
                FailureReason::new(FailureKind::DeliverableValidationError, source.to_string())
            }
            OrchestratorError::ProcessTerminatedUnexpectedly { detail, .. } => {
                FailureReason::new(FailureKind::ProcessTerminatedUnexpectedly, detail.clone())
            }
            OrchestratorError::Store(e) if e.is_write_error() => {
                FailureReason::new(FailureKind::StoreWriteError, e.to_string())
            }
            _ => return None,
        };
        Some(reason)
    }
}
