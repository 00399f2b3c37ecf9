//! 续跑管理器：写检查点、按存储现状对账恢复
//!
//! 恢复时不信任快照里的任务状态：每个 dispatched 任务都按「当前」存储里的交付物重新判定，
//! 已完成任务的交付物若已失效也会被标记为 failed。管理器只产出快照与恢复计划，
//! 不直接修改运行中引擎的任务。

use std::collections::HashMap;

use chrono::Utc;
use serde::Serialize;

use super::checkpoint::{new_checkpoint_id, Checkpoint, SessionSnapshot, CHECKPOINT_FORMAT_VERSION};
use crate::briefing::{load_briefing, validate_briefing, DeliverableValidationError};
use crate::core::error::OrchestratorError;
use crate::store::{validate_segment, KeySpace, SharedStore, StoreError};
use crate::stream::EventLog;
use crate::workflow::{FailureKind, FailureReason, Task, TaskGraph, TaskId, TaskStatus};

/// 对账时对单个任务做出的决定
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileDecision {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
}

/// resume 的产物：新引擎据此启动
#[derive(Debug, Clone)]
pub struct ResumePlan {
    pub checkpoint_id: String,
    pub session_id: String,
    pub goal: String,
    pub graph: TaskGraph,
    pub next_sequence_no: u64,
    /// 从快照补回存储的引擎自有键
    pub restored_keys: Vec<String>,
    pub decisions: Vec<ReconcileDecision>,
}

/// 检查点列表条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub session_id: String,
    pub created_at: chrono::DateTime<Utc>,
    pub tasks: usize,
    pub completed: usize,
}

pub struct ContinuationManager {
    store: SharedStore,
    keys: KeySpace,
}

impl ContinuationManager {
    pub fn new(store: SharedStore, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// 写一条检查点，返回写入的记录
    pub fn checkpoint(&self, snapshot: &SessionSnapshot) -> Result<Checkpoint, OrchestratorError> {
        let mut referenced = vec![self.keys.session_meta(&snapshot.session_id)];
        for task in snapshot.tasks.iter().filter(|t| !t.status.is_terminal()) {
            referenced.push(self.keys.briefing(&task.id));
            if let Some(briefing) = load_briefing(&self.store, &self.keys, &task.id)? {
                referenced.extend(briefing.referenced_keys());
            }
        }
        referenced.sort();
        referenced.dedup();

        let store_key_snapshot = self.store.read_many(&referenced)?.into_iter().collect();
        let last_event_offsets = EventLog::new(self.store.clone(), self.keys.clone())
            .last_offsets(&snapshot.session_id)?;
        let next_sequence_no = last_event_offsets
            .values()
            .map(|seq| seq + 1)
            .max()
            .unwrap_or(0)
            .max(snapshot.next_sequence_no);

        let created_at = Utc::now();
        let checkpoint = Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            checkpoint_id: new_checkpoint_id(created_at),
            session_id: snapshot.session_id.clone(),
            project_id: self.keys.project_id().to_string(),
            goal: snapshot.goal.clone(),
            created_at,
            task_graph_snapshot: snapshot.tasks.clone(),
            worker_process_states: snapshot
                .workers
                .iter()
                .cloned()
                .map(|mut worker| {
                    worker.last_event_offset = last_event_offsets.get(&worker.task_id).copied();
                    worker
                })
                .collect(),
            store_key_snapshot,
            last_event_offsets,
            next_sequence_no,
            digest: String::new(),
        }
        .seal()
        .map_err(StoreError::from)?;

        let key = self.keys.continuation(&checkpoint.checkpoint_id);
        self.store.create(&key, &serde_json::to_value(&checkpoint).map_err(StoreError::from)?)?;
        tracing::info!(
            session_id = %checkpoint.session_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            tasks = checkpoint.task_graph_snapshot.len(),
            workers = checkpoint.worker_process_states.len(),
            keys = checkpoint.store_key_snapshot.len(),
            "checkpoint written"
        );
        Ok(checkpoint)
    }

    /// 读取并校验检查点；任何不一致都拒绝
    pub fn load(&self, checkpoint_id: &str) -> Result<Checkpoint, OrchestratorError> {
        validate_segment(checkpoint_id)
            .map_err(|e| OrchestratorError::corrupt_checkpoint(checkpoint_id, e.to_string()))?;
        let key = self.keys.continuation(checkpoint_id);
        let value = self
            .store
            .get(&key)?
            .ok_or_else(|| OrchestratorError::CheckpointNotFound(checkpoint_id.to_string()))?;
        let checkpoint: Checkpoint = serde_json::from_value(value)
            .map_err(|e| OrchestratorError::corrupt_checkpoint(checkpoint_id, e.to_string()))?;
        checkpoint
            .verify(checkpoint_id)
            .map_err(|reason| OrchestratorError::corrupt_checkpoint(checkpoint_id, reason))?;
        if checkpoint.project_id != self.keys.project_id() {
            return Err(OrchestratorError::SessionMismatch {
                expected: self.keys.project_id().to_string(),
                found: checkpoint.project_id,
            });
        }
        Ok(checkpoint)
    }

    /// 恢复：校验 → 补回引擎自有键 → 按存储现状对账
    pub fn resume(&self, checkpoint_id: &str) -> Result<ResumePlan, OrchestratorError> {
        let checkpoint = self.load(checkpoint_id)?;
        // 结构问题（环、悬空依赖）同样视为检查点损坏
        TaskGraph::from_tasks(checkpoint.task_graph_snapshot.clone())
            .map_err(|e| OrchestratorError::corrupt_checkpoint(checkpoint_id, e.to_string()))?;

        let restored_keys = self.restore_engine_keys(&checkpoint)?;
        let mut tasks = checkpoint.task_graph_snapshot.clone();
        let decisions = self.reconcile(&mut tasks)?;
        for decision in &decisions {
            tracing::info!(
                checkpoint_id = %checkpoint_id,
                task_id = %decision.task_id,
                from = decision.from.as_str(),
                to = decision.to.as_str(),
                reason = %decision.reason,
                "task reconciled"
            );
        }
        let graph = TaskGraph::from_tasks(tasks)
            .map_err(|e| OrchestratorError::corrupt_checkpoint(checkpoint_id, e.to_string()))?;

        tracing::info!(
            session_id = %checkpoint.session_id,
            checkpoint_id = %checkpoint_id,
            restored = restored_keys.len(),
            reconciled = decisions.len(),
            "checkpoint loaded for resume"
        );
        Ok(ResumePlan {
            checkpoint_id: checkpoint.checkpoint_id,
            session_id: checkpoint.session_id,
            goal: checkpoint.goal,
            graph,
            next_sequence_no: checkpoint.next_sequence_no,
            restored_keys,
            decisions,
        })
    }

    /// 某会话最新的检查点 id
    pub fn latest_checkpoint(&self, session_id: &str) -> Result<Option<String>, OrchestratorError> {
        let prefix = format!("{}/", self.keys.continuations());
        for key in self.store.list(&prefix)?.into_iter().rev() {
            let Some(value) = self.store.get(&key)? else {
                continue;
            };
            if value.get("session_id").and_then(|v| v.as_str()) == Some(session_id) {
                if let Some(id) = key.rsplit('/').next() {
                    return Ok(Some(id.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// 列出检查点（按创建时间升序）；损坏的记录跳过并告警
    pub fn list_checkpoints(&self, session_id: Option<&str>) -> Result<Vec<CheckpointSummary>, OrchestratorError> {
        let prefix = format!("{}/", self.keys.continuations());
        let mut out = Vec::new();
        for (key, value) in self.store.scan(&prefix, None, None, usize::MAX)? {
            let checkpoint: Checkpoint = match serde_json::from_value(value) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping unreadable checkpoint");
                    continue;
                }
            };
            if session_id.is_some_and(|s| s != checkpoint.session_id) {
                continue;
            }
            out.push(CheckpointSummary {
                completed: checkpoint
                    .task_graph_snapshot
                    .iter()
                    .filter(|t| t.status == TaskStatus::Completed)
                    .count(),
                tasks: checkpoint.task_graph_snapshot.len(),
                checkpoint_id: checkpoint.checkpoint_id,
                session_id: checkpoint.session_id,
                created_at: checkpoint.created_at,
            });
        }
        Ok(out)
    }

    /// 只补回 Briefing 与会话元信息；Worker 的产出键从不由快照回写
    fn restore_engine_keys(&self, checkpoint: &Checkpoint) -> Result<Vec<String>, OrchestratorError> {
        let briefings = format!("{}/", self.keys.briefings());
        let meta = self.keys.session_meta(&checkpoint.session_id);
        let mut restored = Vec::new();
        for (key, value) in &checkpoint.store_key_snapshot {
            let engine_owned = key.starts_with(&briefings) || *key == meta;
            if !engine_owned || self.keys.is_output_key(key) {
                continue;
            }
            if !self.store.exists(key)? {
                self.store.create(key, value)?;
                restored.push(key.clone());
            }
        }
        Ok(restored)
    }

    fn reconcile(&self, tasks: &mut [Task]) -> Result<Vec<ReconcileDecision>, OrchestratorError> {
        let mut decisions = Vec::new();
        for task in tasks.iter_mut() {
            let from = task.status;
            let verdict = match from {
                TaskStatus::Dispatched => Some(self.reconcile_dispatched(task)?),
                TaskStatus::Completed => self.reconcile_completed(task)?,
                TaskStatus::Briefed => match load_briefing(&self.store, &self.keys, &task.id)? {
                    Some(_) => None,
                    None => Some((TaskStatus::Pending, None, "briefing missing".to_string())),
                },
                TaskStatus::Pending | TaskStatus::Failed => None,
            };
            if let Some((to, failure, reason)) = verdict {
                task.status = to;
                task.failure = failure;
                decisions.push(ReconcileDecision {
                    task_id: task.id.clone(),
                    from,
                    to,
                    reason,
                });
            }
        }

        // 上游在对账中失效时，待派发的下游退回 pending
        loop {
            let statuses: HashMap<TaskId, TaskStatus> =
                tasks.iter().map(|t| (t.id.clone(), t.status)).collect();
            let mut changed = false;
            for task in tasks.iter_mut().filter(|t| t.status == TaskStatus::Briefed) {
                if let Some(dep) = task
                    .depends_on
                    .iter()
                    .find(|d| statuses.get(*d) != Some(&TaskStatus::Completed))
                {
                    decisions.push(ReconcileDecision {
                        task_id: task.id.clone(),
                        from: TaskStatus::Briefed,
                        to: TaskStatus::Pending,
                        reason: format!("dependency {} is no longer completed", dep),
                    });
                    task.status = TaskStatus::Pending;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(decisions)
    }

    fn reconcile_dispatched(&self, task: &mut Task) -> Result<(TaskStatus, Option<FailureReason>, String), OrchestratorError> {
        let Some(briefing) = load_briefing(&self.store, &self.keys, &task.id)? else {
            return Ok((TaskStatus::Pending, None, "briefing missing".to_string()));
        };
        let failures = validate_briefing(&self.store, &briefing)?;
        if failures.is_empty() {
            return Ok((TaskStatus::Completed, None, "deliverables valid in store".to_string()));
        }
        if failures.iter().any(DeliverableValidationError::is_malformed) {
            let detail = join_failures(&failures);
            return Ok((
                TaskStatus::Failed,
                Some(FailureReason::new(FailureKind::DeliverableValidationError, detail.clone())),
                detail,
            ));
        }
        // 进程已不在：重新派发（新一次尝试）
        task.attempt += 1;
        Ok((
            TaskStatus::Briefed,
            None,
            format!("{} deliverable(s) not written yet, re-dispatching", failures.len()),
        ))
    }

    fn reconcile_completed(&self, task: &Task) -> Result<Option<(TaskStatus, Option<FailureReason>, String)>, OrchestratorError> {
        let Some(briefing) = load_briefing(&self.store, &self.keys, &task.id)? else {
            tracing::warn!(task_id = %task.id, "completed task has no briefing; keeping status");
            return Ok(None);
        };
        let failures = validate_briefing(&self.store, &briefing)?;
        if failures.is_empty() {
            return Ok(None);
        }
        let detail = format!("deliverable no longer valid on resume: {}", join_failures(&failures));
        Ok(Some((
            TaskStatus::Failed,
            Some(FailureReason::new(FailureKind::DeliverableValidationError, detail.clone())),
            detail,
        )))
    }
}

fn join_failures(failures: &[DeliverableValidationError]) -> String {
    failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}
