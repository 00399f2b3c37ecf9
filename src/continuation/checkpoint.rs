//! Checkpoint 记录：可序列化的会话快照
//!
//! 快照只描述「当时看到了什么」：任务图、活跃 Worker 描述、被未结束任务引用的键的内容、
//! 每个任务最后的事件序号。恢复时从不重新接管旧进程，只依据存储里的现状重新推导。

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::monitor::WorkerStatus;
use crate::store::validate_key;
use crate::workflow::{Task, TaskId, TaskStatus};

/// 当前检查点格式版本
pub const CHECKPOINT_FORMAT_VERSION: u32 = 1;

/// 检查点时某个活跃 Worker 的描述（仅供审计，恢复时不会重连）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProcessState {
    pub task_id: TaskId,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub attempt: u32,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_offset: Option<u64>,
}

/// 引擎交给续跑管理器的会话快照
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub goal: String,
    pub tasks: Vec<Task>,
    pub workers: Vec<WorkerProcessState>,
    pub next_sequence_no: u64,
}

/// 持久化的检查点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub format_version: u32,
    pub checkpoint_id: String,
    pub session_id: String,
    pub project_id: String,
    pub goal: String,
    pub created_at: DateTime<Utc>,
    pub task_graph_snapshot: Vec<Task>,
    pub worker_process_states: Vec<WorkerProcessState>,
    /// 键 -> 检查点时刻的值
    pub store_key_snapshot: BTreeMap<String, Value>,
    /// task_id -> 该任务最后一条事件的序号
    pub last_event_offsets: BTreeMap<TaskId, u64>,
    pub next_sequence_no: u64,
    /// 除本字段外整份记录的 blake3 摘要（hex）
    #[serde(default)]
    pub digest: String,
}

/// 检查点 id：`ckpt-{毫秒时间戳, 13 位}-{8 位随机}`，字典序即创建顺序
pub fn new_checkpoint_id(now: DateTime<Utc>) -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("ckpt-{:013}-{}", now.timestamp_millis().max(0), suffix)
}

impl Checkpoint {
    pub fn compute_digest(&self) -> Result<String, serde_json::Error> {
        let mut body = self.clone();
        body.digest = String::new();
        let bytes = serde_json::to_vec(&body)?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    pub fn seal(mut self) -> Result<Self, serde_json::Error> {
        self.digest = self.compute_digest()?;
        Ok(self)
    }

    /// 自洽性检查；返回第一处不一致的描述
    pub fn verify(&self, expected_id: &str) -> Result<(), String> {
        if self.format_version != CHECKPOINT_FORMAT_VERSION {
            return Err(format!("unsupported format version {}", self.format_version));
        }
        if self.checkpoint_id != expected_id {
            return Err(format!("record claims id {}", self.checkpoint_id));
        }
        let digest = self.compute_digest().map_err(|e| e.to_string())?;
        if digest != self.digest {
            return Err("digest mismatch".to_string());
        }
        if self.session_id.is_empty() {
            return Err("empty session id".to_string());
        }
        if self.task_graph_snapshot.is_empty() {
            return Err("empty task graph".to_string());
        }

        let statuses: HashMap<&str, TaskStatus> = self
            .task_graph_snapshot
            .iter()
            .map(|t| (t.id.as_str(), t.status))
            .collect();
        for task in &self.task_graph_snapshot {
            let advanced = matches!(
                task.status,
                TaskStatus::Briefed | TaskStatus::Dispatched | TaskStatus::Completed
            );
            if !advanced {
                continue;
            }
            for dep in &task.depends_on {
                if statuses.get(dep.as_str()) != Some(&TaskStatus::Completed) {
                    return Err(format!(
                        "task {} is {} but dependency {} is not completed",
                        task.id, task.status, dep
                    ));
                }
            }
        }

        let dispatched: HashSet<&str> = self
            .task_graph_snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::Dispatched)
            .map(|t| t.id.as_str())
            .collect();
        let mut with_worker = HashSet::new();
        for worker in &self.worker_process_states {
            if !dispatched.contains(worker.task_id.as_str()) {
                return Err(format!("worker recorded for non-dispatched task {}", worker.task_id));
            }
            if !with_worker.insert(worker.task_id.as_str()) {
                return Err(format!("two workers recorded for task {}", worker.task_id));
            }
        }
        if let Some(orphan) = dispatched.difference(&with_worker).next() {
            return Err(format!("dispatched task {} has no worker record", orphan));
        }

        if let Some((task, offset)) = self
            .last_event_offsets
            .iter()
            .find(|(_, offset)| **offset >= self.next_sequence_no)
        {
            return Err(format!(
                "event offset {} of task {} is beyond next sequence {}",
                offset, task, self.next_sequence_no
            ));
        }
        for key in self.store_key_snapshot.keys() {
            validate_key(key).map_err(|e| e.to_string())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Role;

    fn checkpoint() -> Checkpoint {
        let a = Task::new("a", Role::Analyst, "Analyze");
        let mut b = Task::new("b", Role::Implementer, "Implement").depends_on("a");
        b.status = TaskStatus::Pending;
        let mut a_done = a;
        a_done.status = TaskStatus::Completed;
        Checkpoint {
            format_version: CHECKPOINT_FORMAT_VERSION,
            checkpoint_id: "ckpt-0000000000001-abcdef01".into(),
            session_id: "s1".into(),
            project_id: "p".into(),
            goal: "tidy".into(),
            created_at: Utc::now(),
            task_graph_snapshot: vec![a_done, b],
            worker_process_states: Vec::new(),
            store_key_snapshot: BTreeMap::from([(
                "/projects/p/sessions/s1/meta".to_string(),
                serde_json::json!({"goal": "tidy"}),
            )]),
            last_event_offsets: BTreeMap::from([("a".to_string(), 4)]),
            next_sequence_no: 5,
            digest: String::new(),
        }
        .seal()
        .unwrap()
    }

    #[test]
    fn test_sealed_checkpoint_verifies_and_survives_serialization() {
        let ckpt = checkpoint();
        ckpt.verify(&ckpt.checkpoint_id).unwrap();
        let raw = serde_json::to_string(&ckpt).unwrap();
        let back: Checkpoint = serde_json::from_str(&raw).unwrap();
        back.verify(&ckpt.checkpoint_id).unwrap();
    }

    #[test]
    fn test_float_snapshot_values_verify_after_store_round_trip() {
        let mut ckpt = checkpoint();
        ckpt.store_key_snapshot.insert(
            "/projects/p/tasks/outputs/a/metrics".to_string(),
            serde_json::json!({
                "ratio": 0.1 + 0.2,
                "tiny": 2.2250738585072014e-308,
                "subnormal": 5e-324,
                "huge": 1.7976931348623157e308,
                "score": 123456.78901234567,
                "series": [1.0000000000000002, -0.000123456789012345, 9007199254740993.0],
            }),
        );
        let ckpt = ckpt.seal().unwrap();

        let store = crate::store::SharedStore::open_in_memory().unwrap();
        let key = "/projects/p/continuations/ckpt-0000000000001-abcdef01";
        store.write_as(key, &ckpt).unwrap();
        let back: Checkpoint = store.read_as(key).unwrap();
        back.verify(&ckpt.checkpoint_id).unwrap();
        assert_eq!(back.digest, ckpt.digest);
    }

    #[test]
    fn test_tampering_is_detected() {
        let mut ckpt = checkpoint();
        ckpt.goal = "something else".into();
        assert_eq!(ckpt.verify(&ckpt.checkpoint_id.clone()).unwrap_err(), "digest mismatch");
    }

    #[test]
    fn test_inconsistent_snapshot_is_rejected() {
        let mut ckpt = checkpoint();
        ckpt.task_graph_snapshot[1].status = TaskStatus::Dispatched;
        let ckpt = ckpt.seal().unwrap();
        // dispatched 但没有 Worker 记录
        let err = ckpt.verify(&ckpt.checkpoint_id).unwrap_err();
        assert!(err.contains("no worker record"), "{err}");

        let mut ckpt = checkpoint();
        ckpt.next_sequence_no = 2;
        let ckpt = ckpt.seal().unwrap();
        assert!(ckpt.verify(&ckpt.checkpoint_id).unwrap_err().contains("beyond"));
    }

    #[test]
    fn test_checkpoint_ids_sort_by_time() {
        let early = new_checkpoint_id(DateTime::from_timestamp_millis(1_000).unwrap());
        let late = new_checkpoint_id(DateTime::from_timestamp_millis(2_000_000).unwrap());
        assert!(early < late);
        assert!(early.starts_with("ckpt-0000000001000-"));
    }
}
