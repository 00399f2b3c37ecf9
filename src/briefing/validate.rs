//! 交付物形状校验
//!
//! 只做最小形状检查：键存在、非空、能按声明类型解析。空串、纯空白、`null`、空对象/空数组
//! 一律视为校验失败。

use serde_json::Value;
use thiserror::Error;

use super::{Deliverable, DeliverableType, TaskBriefing};
use crate::store::{SharedStore, StoreError};

/// 交付物校验失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliverableValidationError {
    #[error("required deliverable missing: {key}")]
    Missing { key: String },

    #[error("deliverable is empty: {key}")]
    Empty { key: String },

    #[error("deliverable {key} is not a valid {expected}")]
    WrongShape { key: String, expected: DeliverableType },
}

impl DeliverableValidationError {
    pub fn key(&self) -> &str {
        match self {
            DeliverableValidationError::Missing { key }
            | DeliverableValidationError::Empty { key }
            | DeliverableValidationError::WrongShape { key, .. } => key,
        }
    }

    /// 键存在但内容不合格（与「尚未写出」区分，恢复对账时使用）
    pub fn is_malformed(&self) -> bool {
        !matches!(self, DeliverableValidationError::Missing { .. })
    }
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// 文本类交付物：非空字符串，或带非空 `content` 字段的对象
fn text_body(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Object(obj) => obj.get("content").and_then(Value::as_str),
        _ => None,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => is_blank(s),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// 校验单个值是否满足声明类型
pub fn check_shape(key: &str, kind: DeliverableType, value: &Value) -> Result<(), DeliverableValidationError> {
    if is_empty_value(value) {
        return Err(DeliverableValidationError::Empty { key: key.to_string() });
    }
    let wrong = || DeliverableValidationError::WrongShape {
        key: key.to_string(),
        expected: kind,
    };
    match kind {
        DeliverableType::Text | DeliverableType::Markdown | DeliverableType::Code => match text_body(value) {
            Some(body) if !is_blank(body) => Ok(()),
            Some(_) => Err(DeliverableValidationError::Empty { key: key.to_string() }),
            None => Err(wrong()),
        },
        DeliverableType::Json => match value {
            Value::Object(_) | Value::Array(_) => Ok(()),
            // 字符串形式的 JSON 文档也接受，只要能解析且非空
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(inner) if !is_empty_value(&inner) => Ok(()),
                Ok(_) => Err(DeliverableValidationError::Empty { key: key.to_string() }),
                Err(_) => Err(wrong()),
            },
            _ => Err(wrong()),
        },
        DeliverableType::List => match value {
            Value::Array(_) => Ok(()),
            Value::Object(obj) => match obj.get("items") {
                Some(Value::Array(items)) if !items.is_empty() => Ok(()),
                Some(Value::Array(_)) => Err(DeliverableValidationError::Empty { key: key.to_string() }),
                _ => Err(wrong()),
            },
            _ => Err(wrong()),
        },
    }
}

/// 校验单个交付物在当前存储中的状态
pub fn validate_deliverable(store: &SharedStore, deliverable: &Deliverable) -> Result<Result<(), DeliverableValidationError>, StoreError> {
    match store.get(&deliverable.output_key)? {
        None => Ok(Err(DeliverableValidationError::Missing {
            key: deliverable.output_key.clone(),
        })),
        Some(value) => Ok(check_shape(&deliverable.output_key, deliverable.kind, &value)),
    }
}

/// 校验某个 Briefing 的全部 required 交付物，返回所有失败项（空表示通过）
///
/// 外层 `Err` 只表示读存储失败；逐键读取，不假设多个键同时可见。
pub fn validate_briefing(store: &SharedStore, briefing: &TaskBriefing) -> Result<Vec<DeliverableValidationError>, StoreError> {
    let mut failures = Vec::new();
    for deliverable in briefing.deliverables.iter().filter(|d| d.required) {
        if let Err(e) = validate_deliverable(store, deliverable)? {
            failures.push(e);
        }
    }
    Ok(failures)
}
