//! 存储层错误
//!
//! 写入类错误（对应「StoreWriteError」）保证事务整体回滚，不会留下部分写入。

use std::path::PathBuf;

use thiserror::Error;

/// 共享存储操作可能返回的错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    /// 只允许创建一次的键（如 Briefing）被写入了不同内容
    #[error("Key already exists with different content: {0}")]
    AlreadyExists(String),

    #[error("Value for '{key}' is {size} bytes, limit is {limit}")]
    ValueTooLarge { key: String, size: usize, limit: usize },

    #[error("Value for '{key}' is not a valid document: {reason}")]
    InvalidValue { key: String, reason: String },

    /// 存储文件无法继续增长（max_store_bytes 或磁盘已满）
    #[error("Store at {path:?} cannot grow to accommodate the write")]
    StoreFull { path: PathBuf },

    #[error("Store corrupt: {0}")]
    Corrupt(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// 是否属于写入失败（事务已回滚，调用方可按自身策略重试）
    pub fn is_write_error(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyExists(_)
                | StoreError::ValueTooLarge { .. }
                | StoreError::InvalidValue { .. }
                | StoreError::StoreFull { .. }
                | StoreError::Sqlite(_)
        )
    }

    /// 是否为致命错误：引擎无法在没有可靠持久状态的情况下继续
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Corrupt(_) | StoreError::StoreFull { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_error_classification() {
        let err = StoreError::ValueTooLarge {
            key: "/a".into(),
            size: 10,
            limit: 5,
        };
        assert!(err.is_write_error());
        assert!(!err.is_fatal());

        assert!(!StoreError::NotFound("/a".into()).is_write_error());
        assert!(StoreError::Corrupt("bad page".into()).is_fatal());
        assert!(StoreError::StoreFull { path: "/tmp/x".into() }.is_fatal());
    }
}
