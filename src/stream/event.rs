//! Worker 输出行的分类
//!
//! 结构化行是带 `"type"` 判别字段的 JSON 对象：
//!
//! ```text
//! {"type":"lifecycle","phase":"started"}
//! {"type":"tool_call","call_id":"c1","name":"grep","input":{...}}
//! {"type":"tool_result","call_id":"c1","output":...}
//! {"type":"terminal"}
//! ```
//!
//! 另外，独占一行的 [`TERMINAL_MARKER`] 也视为完成标记。其它内容（自由文本、坏 JSON、
//! 未知类型）解析为 [`ParseError`]，由路由器以 ParseError 事件落盘，不会中断流。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// 纯文本形式的完成标记
pub const TERMINAL_MARKER: &str = "[[HIVE:TASK_COMPLETE]]";

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Lifecycle,
    ToolCall,
    ToolResult,
    Terminal,
    ParseError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Lifecycle => "lifecycle",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::Terminal => "terminal",
            EventKind::ParseError => "parse_error",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "lifecycle" => Some(EventKind::Lifecycle),
            "tool_call" => Some(EventKind::ToolCall),
            "tool_result" => Some(EventKind::ToolResult),
            "terminal" => Some(EventKind::Terminal),
            _ => None,
        }
    }

    pub fn is_tool(&self) -> bool {
        matches!(self, EventKind::ToolCall | EventKind::ToolResult)
    }
}

/// 会话事件日志中的一条记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub session_id: String,
    pub task_id: String,
    pub sequence_no: u64,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl Event {
    /// tool_call / tool_result 的调用 id；缺省时退化为 `seq-{sequence_no}`
    pub fn call_id(&self) -> Option<String> {
        if !self.kind.is_tool() {
            return None;
        }
        let id = self
            .payload
            .get("call_id")
            .or_else(|| self.payload.get("id"))
            .and_then(|v| match v {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
        Some(id.unwrap_or_else(|| format!("seq-{}", self.sequence_no)))
    }
}

/// 一行无法解析为结构化事件
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unparseable worker line ({reason}): {line}")]
pub struct ParseError {
    pub line: String,
    pub reason: String,
}

impl ParseError {
    fn new(line: &str, reason: impl Into<String>) -> Self {
        Self {
            line: line.to_string(),
            reason: reason.into(),
        }
    }

    /// 作为 ParseError 事件落盘时的载荷
    pub fn to_payload(&self) -> Value {
        json!({ "raw": self.line, "reason": self.reason })
    }
}

/// 解析结果：类型 + 载荷（不含会话/任务/序号，这些由路由器补上）
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLine {
    pub kind: EventKind,
    pub payload: Value,
}

/// 分类一行 Worker 输出
pub fn parse(line: &str) -> Result<ParsedLine, ParseError> {
    let trimmed = line.trim();
    if trimmed == TERMINAL_MARKER {
        return Ok(ParsedLine {
            kind: EventKind::Terminal,
            payload: Value::Object(Map::new()),
        });
    }
    if !trimmed.starts_with('{') {
        return Err(ParseError::new(line, "not a structured event"));
    }
    let value: Value =
        serde_json::from_str(trimmed).map_err(|e| ParseError::new(line, format!("invalid JSON: {}", e)))?;
    let Value::Object(mut obj) = value else {
        return Err(ParseError::new(line, "not a JSON object"));
    };
    let tag = match obj.remove("type") {
        Some(Value::String(tag)) => tag,
        Some(_) => return Err(ParseError::new(line, "\"type\" is not a string")),
        None => return Err(ParseError::new(line, "missing \"type\" tag")),
    };
    let kind = EventKind::from_tag(&tag)
        .ok_or_else(|| ParseError::new(line, format!("unknown event type '{}'", tag)))?;
    Ok(ParsedLine {
        kind,
        payload: Value::Object(obj),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_kinds() {
        let p = parse(r#"{"type":"lifecycle","phase":"started"}"#).unwrap();
        assert_eq!(p.kind, EventKind::Lifecycle);
        assert_eq!(p.payload, json!({"phase": "started"}));

        let p = parse(r#"{"type":"tool_call","call_id":"c1","name":"grep"}"#).unwrap();
        assert_eq!(p.kind, EventKind::ToolCall);
        assert!(p.kind.is_tool());

        assert_eq!(parse(r#"  {"type":"terminal"}  "#).unwrap().kind, EventKind::Terminal);
        assert_eq!(parse(TERMINAL_MARKER).unwrap().kind, EventKind::Terminal);
    }

    #[test]
    fn test_malformed_lines_are_parse_errors() {
        let err = parse("compiling module foo...").unwrap_err();
        assert_eq!(err.line, "compiling module foo...");

        assert!(parse(r#"{"type":"tool_call""#).unwrap_err().reason.starts_with("invalid JSON"));
        assert!(parse(r#"{"phase":"x"}"#).unwrap_err().reason.contains("missing"));
        assert!(parse(r#"{"type":"bogus"}"#).unwrap_err().reason.contains("bogus"));
        assert!(parse(r#"{"type":7}"#).is_err());
        // 标记必须独占一行
        assert!(parse("done [[HIVE:TASK_COMPLETE]]").is_err());
    }

    #[test]
    fn test_call_id_fallback() {
        let ev = Event {
            session_id: "s".into(),
            task_id: "t".into(),
            sequence_no: 9,
            kind: EventKind::ToolResult,
            timestamp: Utc::now(),
            payload: json!({"output": "x"}),
        };
        assert_eq!(ev.call_id().as_deref(), Some("seq-9"));

        let ev = Event {
            payload: json!({"call_id": "abc"}),
            ..ev
        };
        assert_eq!(ev.call_id().as_deref(), Some("abc"));
    }
}
