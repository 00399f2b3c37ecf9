//! 键命名空间
//!
//! 所有键都是以 `/` 开头的层级路径，布局对外部工具稳定：
//!
//! ```text
//! /projects/{project_id}/config
//! /projects/{project_id}/tasks/briefings/{task_id}
//! /projects/{project_id}/tasks/status/{task_id}
//! /projects/{project_id}/tasks/outputs/{task_id}/...
//! /projects/{project_id}/sessions/{session_id}/meta
//! /projects/{project_id}/sessions/{session_id}/events/{sequence_no}
//! /projects/{project_id}/sessions/{session_id}/tools/{task_id}/{call_id}/{call|result}
//! /projects/{project_id}/continuations/{checkpoint_id}
//! ```

use crate::store::StoreError;

/// 单个键允许的最大长度
pub const MAX_KEY_LEN: usize = 512;

/// 比所有合法键字符都大的哨兵字符，用于前缀范围查询的上界
pub(crate) const PREFIX_SENTINEL: char = '\u{7f}';

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '~' | ':' | '@' | '+' | '=' | ',' | '%')
}

/// 校验完整键：以 `/` 开头、无空段、无结尾 `/`、仅含安全 ASCII 字符
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };
    if !key.starts_with('/') {
        return Err(invalid("must start with '/'"));
    }
    if key.len() < 2 {
        return Err(invalid("must name at least one segment"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(invalid("too long"));
    }
    if key.ends_with('/') {
        return Err(invalid("must not end with '/'"));
    }
    if key.contains("//") {
        return Err(invalid("empty path segment"));
    }
    if let Some(c) = key.chars().find(|c| !is_key_char(*c)) {
        return Err(invalid(&format!("illegal character {:?}", c)));
    }
    if key.split('/').any(|seg| seg == "." || seg == "..") {
        return Err(invalid("relative path segment"));
    }
    Ok(())
}

/// 校验前缀：空串或以 `/` 开头，字符集与键一致（允许以 `/` 结尾）
pub fn validate_prefix(prefix: &str) -> Result<(), StoreError> {
    if prefix.is_empty() {
        return Ok(());
    }
    let trimmed = prefix.strip_suffix('/').unwrap_or(prefix);
    if trimmed.is_empty() {
        return Ok(());
    }
    validate_key(trimmed)
}

/// 校验用作单个路径段的 id（task_id、session_id 等）
pub fn validate_segment(segment: &str) -> Result<(), StoreError> {
    if segment.is_empty() || segment.contains('/') {
        return Err(StoreError::InvalidKey {
            key: segment.to_string(),
            reason: "not a single path segment".to_string(),
        });
    }
    validate_key(&format!("/{}", segment))
}

/// 前缀范围查询的上界（不含）
pub(crate) fn prefix_upper_bound(prefix: &str) -> String {
    format!("{}{}", prefix, PREFIX_SENTINEL)
}

/// 某个项目下的键空间
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    project_id: String,
    root: String,
}

impl KeySpace {
    pub fn new(project_id: impl Into<String>) -> Result<Self, StoreError> {
        let project_id = project_id.into();
        validate_segment(&project_id)?;
        let root = format!("/projects/{}", project_id);
        Ok(Self { project_id, root })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// 项目级配置文档（Briefing 的 context pointer 之一）
    pub fn config(&self) -> String {
        format!("{}/config", self.root)
    }

    pub fn briefings(&self) -> String {
        format!("{}/tasks/briefings", self.root)
    }

    pub fn briefing(&self, task_id: &str) -> String {
        format!("{}/{}", self.briefings(), task_id)
    }

    pub fn statuses(&self) -> String {
        format!("{}/tasks/status", self.root)
    }

    pub fn status(&self, task_id: &str) -> String {
        format!("{}/{}", self.statuses(), task_id)
    }

    /// 某任务的产出空间：仅 Worker 可写
    pub fn outputs(&self, task_id: &str) -> String {
        format!("{}/tasks/outputs/{}", self.root, task_id)
    }

    pub fn output(&self, task_id: &str, name: &str) -> String {
        format!("{}/{}", self.outputs(task_id), name)
    }

    pub fn session(&self, session_id: &str) -> String {
        format!("{}/sessions/{}", self.root, session_id)
    }

    pub fn session_meta(&self, session_id: &str) -> String {
        format!("{}/meta", self.session(session_id))
    }

    /// 会话事件日志前缀
    pub fn events(&self, session_id: &str) -> String {
        format!("{}/events", self.session(session_id))
    }

    /// 单条事件键；序号补零到 20 位，保证字典序即序号序
    pub fn event(&self, session_id: &str, sequence_no: u64) -> String {
        format!("{}/{:020}", self.events(session_id), sequence_no)
    }

    pub fn tool_call(&self, session_id: &str, task_id: &str, call_id: &str) -> String {
        format!("{}/tools/{}/{}/call", self.session(session_id), task_id, call_id)
    }

    pub fn tool_result(&self, session_id: &str, task_id: &str, call_id: &str) -> String {
        format!("{}/tools/{}/{}/result", self.session(session_id), task_id, call_id)
    }

    pub fn continuations(&self) -> String {
        format!("{}/continuations", self.root)
    }

    pub fn continuation(&self, checkpoint_id: &str) -> String {
        format!("{}/{}", self.continuations(), checkpoint_id)
    }

    /// 是否落在任意任务的产出空间内（引擎不得写入）
    pub fn is_output_key(&self, key: &str) -> bool {
        key.strip_prefix(&self.root)
            .map(|rest| rest.starts_with("/tasks/outputs/"))
            .unwrap_or(false)
    }

    /// 从事件键解析序号
    pub fn parse_event_sequence(key: &str) -> Option<u64> {
        key.rsplit('/').next().and_then(|s| s.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("/projects/p1/tasks/status/t-1").is_ok());
        assert!(validate_key("projects/p1").is_err());
        assert!(validate_key("/").is_err());
        assert!(validate_key("/a//b").is_err());
        assert!(validate_key("/a/b/").is_err());
        assert!(validate_key("/a/b c").is_err());
        assert!(validate_key("/a/../b").is_err());
        assert!(validate_key(&format!("/{}", "x".repeat(MAX_KEY_LEN))).is_err());
    }

    #[test]
    fn test_keyspace_layout() {
        let ks = KeySpace::new("demo").unwrap();
        assert_eq!(ks.briefing("t1"), "/projects/demo/tasks/briefings/t1");
        assert_eq!(ks.status("t1"), "/projects/demo/tasks/status/t1");
        assert_eq!(ks.output("t1", "report"), "/projects/demo/tasks/outputs/t1/report");
        assert_eq!(ks.continuation("c1"), "/projects/demo/continuations/c1");
        assert_eq!(
            ks.event("s1", 7),
            "/projects/demo/sessions/s1/events/00000000000000000007"
        );
        assert_eq!(KeySpace::parse_event_sequence(&ks.event("s1", 42)), Some(42));
    }

    #[test]
    fn test_output_space_detection() {
        let ks = KeySpace::new("demo").unwrap();
        assert!(ks.is_output_key(&ks.output("t1", "x")));
        assert!(!ks.is_output_key(&ks.status("t1")));
        assert!(!ks.is_output_key("/projects/other/tasks/outputs/t1/x"));
    }

    #[test]
    fn test_event_keys_sort_by_sequence() {
        let ks = KeySpace::new("demo").unwrap();
        assert!(ks.event("s", 9) < ks.event("s", 10));
        assert!(ks.event("s", 10) < prefix_upper_bound(&ks.events("s")));
    }

    #[test]
    fn test_invalid_project_id() {
        assert!(KeySpace::new("a/b").is_err());
        assert!(KeySpace::new("").is_err());
    }
}
