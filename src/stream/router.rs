//! 事件路由：给解析结果打上会话/任务/序号，追加到会话事件日志
//!
//! tool_call / tool_result 的载荷另外落到 `sessions/{s}/tools/{task}/{call}/{call|result}`。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};

use super::event::{parse, Event, EventKind};
use crate::store::{KeySpace, SharedStore, StoreError};

/// 会话内共享的序号分配器
#[derive(Debug, Clone, Default)]
pub struct SequenceAllocator {
    next: Arc<AtomicU64>,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(next: u64) -> Self {
        Self {
            next: Arc::new(AtomicU64::new(next)),
        }
    }

    /// 从已落盘的日志恢复：下一个序号 = 最大序号 + 1
    pub fn restore(store: &SharedStore, keys: &KeySpace, session_id: &str) -> Result<Self, StoreError> {
        let last = store
            .list(&format!("{}/", keys.events(session_id)))?
            .iter()
            .filter_map(|k| KeySpace::parse_event_sequence(k))
            .max();
        Ok(Self::starting_at(last.map(|n| n + 1).unwrap_or(0)))
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// 下一个将被分配的序号
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    /// 保证之后分配的序号不小于 `at_least`
    pub fn advance_to(&self, at_least: u64) {
        self.next.fetch_max(at_least, Ordering::SeqCst);
    }
}

/// 将非法字符替换为 `_`，使任意字符串都能用作单个键段
pub fn sanitize_segment(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .take(128)
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '~' | ':' | '@' | '+' | '=' | ',') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// 单个会话的事件路由器（可廉价 Clone，各 Worker 监控任务各持一份）
#[derive(Debug, Clone)]
pub struct EventRouter {
    store: SharedStore,
    keys: KeySpace,
    session_id: String,
    sequences: SequenceAllocator,
}

impl EventRouter {
    pub fn new(store: SharedStore, keys: KeySpace, session_id: impl Into<String>, sequences: SequenceAllocator) -> Self {
        Self {
            store,
            keys,
            session_id: session_id.into(),
            sequences,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sequences(&self) -> &SequenceAllocator {
        &self.sequences
    }

    /// 解析一行并打上元信息；坏行变为 ParseError 事件而不是错误
    pub fn stamp(&self, task_id: &str, line: &str) -> Event {
        let (kind, payload) = match parse(line) {
            Ok(parsed) => (parsed.kind, parsed.payload),
            Err(err) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    task_id = %task_id,
                    reason = %err.reason,
                    "unparseable worker output"
                );
                (EventKind::ParseError, err.to_payload())
            }
        };
        self.event(task_id, kind, payload)
    }

    /// 由引擎自身产生的事件（如 Worker 退出）
    pub fn event(&self, task_id: &str, kind: EventKind, payload: Value) -> Event {
        Event {
            session_id: self.session_id.clone(),
            task_id: task_id.to_string(),
            sequence_no: self.sequences.allocate(),
            kind,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// 追加事件到日志；工具类事件另外落到工具键
    ///
    /// 超过存储单值上限的事件以截断形式落盘，载荷保留原文前缀与原始字节数。
    pub fn route(&self, event: &Event) -> Result<(), StoreError> {
        let key = self.keys.event(&event.session_id, event.sequence_no);
        let truncated = match self.store.create(&key, &serde_json::to_value(event)?) {
            Ok(_) => None,
            Err(StoreError::ValueTooLarge { size, limit, .. }) => {
                let truncated = truncate_event(event, size, limit)?;
                self.store.create(&key, &serde_json::to_value(&truncated)?)?;
                tracing::warn!(
                    session_id = %event.session_id,
                    task_id = %event.task_id,
                    sequence_no = event.sequence_no,
                    size,
                    limit,
                    "oversized worker event truncated"
                );
                Some(truncated)
            }
            Err(e) => return Err(e),
        };
        let event = truncated.as_ref().unwrap_or(event);
        if let Some(call_id) = event.call_id() {
            let call_id = sanitize_segment(&call_id);
            let task_id = sanitize_segment(&event.task_id);
            let tool_key = match event.kind {
                EventKind::ToolCall => self.keys.tool_call(&event.session_id, &task_id, &call_id),
                _ => self.keys.tool_result(&event.session_id, &task_id, &call_id),
            };
            self.store.write(&tool_key, &event.payload)?;
        }
        tracing::debug!(
            session_id = %event.session_id,
            task_id = %event.task_id,
            sequence_no = event.sequence_no,
            kind = event.kind.as_str(),
            "event routed"
        );
        Ok(())
    }

    /// stamp + route
    pub fn route_line(&self, task_id: &str, line: &str) -> Result<Event, StoreError> {
        let event = self.stamp(task_id, line);
        self.route(&event)?;
        Ok(event)
    }
}

/// 把事件载荷收缩为 `{truncated, original_bytes, prefix}`，直到整条事件不超过 `limit`
fn truncate_event(event: &Event, original_bytes: usize, limit: usize) -> Result<Event, StoreError> {
    let text = event
        .payload
        .get("raw")
        .and_then(Value::as_str)
        .map(String::from)
        .unwrap_or_else(|| event.payload.to_string());
    let mut budget = limit / 4;
    loop {
        let mut end = budget.min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let mut payload = json!({
            "truncated": true,
            "original_bytes": original_bytes,
            "prefix": &text[..end],
        });
        for field in ["call_id", "reason", "phase"] {
            if let Some(v) = event.payload.get(field).filter(|v| !v.is_object() && !v.is_array()) {
                if v.to_string().len() <= 256 {
                    payload[field] = v.clone();
                }
            }
        }
        let candidate = Event {
            payload,
            ..event.clone()
        };
        if budget == 0 || serde_json::to_string(&candidate)?.len() <= limit {
            return Ok(candidate);
        }
        budget /= 2;
    }
}

/// 事件日志的只读视图
#[derive(Debug, Clone)]
pub struct EventLog {
    store: SharedStore,
    keys: KeySpace,
}

impl EventLog {
    pub fn new(store: SharedStore, keys: KeySpace) -> Self {
        Self { store, keys }
    }

    /// 按序号范围读取：从 `from_seq`（含）开始最多 `limit` 条
    pub fn read(&self, session_id: &str, from_seq: u64, limit: usize) -> Result<Vec<Event>, StoreError> {
        let prefix = format!("{}/", self.keys.events(session_id));
        let start = self.keys.event(session_id, from_seq);
        self.store
            .scan(&prefix, Some(&start), None, limit)?
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_value(value).map_err(|e| StoreError::InvalidValue {
                    key,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    /// 读取整个会话日志
    pub fn read_all(&self, session_id: &str) -> Result<Vec<Event>, StoreError> {
        self.read(session_id, 0, usize::MAX >> 1)
    }

    /// 某任务的全部事件
    pub fn for_task(&self, session_id: &str, task_id: &str) -> Result<Vec<Event>, StoreError> {
        Ok(self
            .read_all(session_id)?
            .into_iter()
            .filter(|e| e.task_id == task_id)
            .collect())
    }

    /// 每个任务最后一条事件的序号
    pub fn last_offsets(&self, session_id: &str) -> Result<BTreeMap<String, u64>, StoreError> {
        let mut offsets = BTreeMap::new();
        for event in self.read_all(session_id)? {
            let entry = offsets.entry(event.task_id).or_insert(event.sequence_no);
            *entry = (*entry).max(event.sequence_no);
        }
        Ok(offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreOptions;

    fn setup() -> (SharedStore, KeySpace, EventRouter) {
        let store = SharedStore::open_in_memory().unwrap();
        let keys = KeySpace::new("p").unwrap();
        let router = EventRouter::new(store.clone(), keys.clone(), "s1", SequenceAllocator::new());
        (store, keys, router)
    }

    #[test]
    fn test_route_appends_in_sequence_order() {
        let (store, keys, router) = setup();
        router.route_line("t1", r#"{"type":"lifecycle","phase":"started"}"#).unwrap();
        router.route_line("t1", "some free text").unwrap();
        router.route_line("t1", "[[HIVE:TASK_COMPLETE]]").unwrap();

        let log = EventLog::new(store, keys);
        let events = log.read_all("s1").unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Lifecycle, EventKind::ParseError, EventKind::Terminal]);
        assert_eq!(events.iter().map(|e| e.sequence_no).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(events[1].payload["raw"], json!("some free text"));
    }

    #[test]
    fn test_tool_events_are_materialized() {
        let (store, keys, router) = setup();
        router
            .route_line("t1", r#"{"type":"tool_call","call_id":"c/1","name":"grep","input":{"q":"x"}}"#)
            .unwrap();
        router
            .route_line("t1", r#"{"type":"tool_result","call_id":"c/1","output":"found"}"#)
            .unwrap();

        let call = store.read(&keys.tool_call("s1", "t1", "c_1")).unwrap();
        assert_eq!(call["name"], json!("grep"));
        let result = store.read(&keys.tool_result("s1", "t1", "c_1")).unwrap();
        assert_eq!(result["output"], json!("found"));
    }

    #[test]
    fn test_read_range_and_offsets() {
        let (store, keys, router) = setup();
        for i in 0..5 {
            let task = if i % 2 == 0 { "a" } else { "b" };
            router.route_line(task, r#"{"type":"lifecycle"}"#).unwrap();
        }
        let log = EventLog::new(store.clone(), keys.clone());
        let page = log.read("s1", 2, 2).unwrap();
        assert_eq!(page.iter().map(|e| e.sequence_no).collect::<Vec<_>>(), vec![2, 3]);

        let offsets = log.last_offsets("s1").unwrap();
        assert_eq!(offsets.get("a"), Some(&4));
        assert_eq!(offsets.get("b"), Some(&3));

        let restored = SequenceAllocator::restore(&store, &keys, "s1").unwrap();
        assert_eq!(restored.peek(), 5);
    }

    #[test]
    fn test_log_is_append_only() {
        let (_store, _keys, router) = setup();
        let first = router.stamp("t1", r#"{"type":"lifecycle"}"#);
        router.route(&first).unwrap();
        let mut forged = first.clone();
        forged.payload = json!({"rewritten": true});
        assert!(matches!(router.route(&forged), Err(StoreError::AlreadyExists(_))));
    }

    #[test]
    fn test_oversized_line_is_stored_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(
            dir.path().join("store.db"),
            StoreOptions {
                max_value_bytes: 4096,
                ..StoreOptions::default()
            },
        )
        .unwrap();
        let keys = KeySpace::new("p").unwrap();
        let router = EventRouter::new(store.clone(), keys.clone(), "s1", SequenceAllocator::new());

        let line = "x".repeat(20_000);
        let event = router.route_line("t1", &line).unwrap();
        let big_call = format!(r#"{{"type":"tool_call","call_id":"c1","input":"{}"}}"#, "y".repeat(20_000));
        router.route_line("t1", &big_call).unwrap();

        let events = EventLog::new(store.clone(), keys.clone()).read_all("s1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence_no, event.sequence_no);
        assert_eq!(events[0].kind, EventKind::ParseError);
        assert_eq!(events[0].payload["truncated"], json!(true));
        assert!(events[0].payload["original_bytes"].as_u64().unwrap() > 20_000);
        let prefix = events[0].payload["prefix"].as_str().unwrap();
        assert!(!prefix.is_empty() && line.starts_with(prefix));

        assert_eq!(events[1].kind, EventKind::ToolCall);
        assert_eq!(events[1].payload["call_id"], json!("c1"));
        let call = store.read(&keys.tool_call("s1", "t1", "c1")).unwrap();
        assert_eq!(call["truncated"], json!(true));
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("call 1/x"), "call_1_x");
        assert_eq!(sanitize_segment(".."), "_");
        assert_eq!(sanitize_segment(""), "_");
    }
}
