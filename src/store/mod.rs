//! 共享存储：事务型、层级命名空间的 KV 引擎
//!
//! 引擎与所有 Worker 进程之间唯一的共享可变资源，基于单个 SQLite 文件（WAL 模式）：
//! - 每次变更都在事务内完成：值 + 版本号递增一起提交，失败则整体回滚
//! - 版本号全局单调递增（meta.revision），watch 依此识别变更
//! - 支持前缀列举、游标范围扫描与轮询式 watch（见 [`watch`]）
//!
//! Worker 进程通过环境变量 `HIVE_STORE_PATH` 打开同一个文件。

pub mod error;
pub mod keys;
pub mod watch;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

pub use error::StoreError;
pub use keys::{validate_key, validate_segment, KeySpace};
pub use watch::{ChangeEvent, ChangeKind, Watch, WatchPattern};

use crate::config::StoreSection;

/// 记录版本号（全局单调）
pub type Version = u64;

/// Worker 通过该环境变量找到存储文件
pub const STORE_PATH_ENV: &str = "HIVE_STORE_PATH";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    version INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS meta (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO meta (name, value) VALUES ('revision', 0);
";

/// 存储打开参数
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// 单个值序列化后的最大字节数
    pub max_value_bytes: usize,
    /// 存储文件允许增长到的最大字节数
    pub max_store_bytes: u64,
    /// 多进程并发写时的锁等待
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_value_bytes: 1024 * 1024,
            max_store_bytes: 256 * 1024 * 1024,
            busy_timeout: Duration::from_millis(5000),
        }
    }
}

impl From<&StoreSection> for StoreOptions {
    fn from(section: &StoreSection) -> Self {
        Self {
            max_value_bytes: section.max_value_bytes,
            max_store_bytes: section.max_store_bytes,
            busy_timeout: Duration::from_millis(section.busy_timeout_ms),
        }
    }
}

/// 一条完整记录
#[derive(Debug, Clone, PartialEq)]
pub struct StoreRecord {
    pub key: String,
    pub value: Value,
    pub version: Version,
    /// 毫秒时间戳
    pub updated_at: i64,
}

struct StoreInner {
    conn: Mutex<Connection>,
    path: PathBuf,
    options: StoreOptions,
}

/// 共享存储句柄（可廉价 Clone，内部共享同一连接）
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for SharedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

impl SharedStore {
    /// 打开（或创建）磁盘上的存储文件
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!("cannot create store directory {:?}: {}", parent, e))
                })?;
            }
        }
        let conn = Connection::open(&path)?;
        Self::init(conn, path, options)
    }

    /// 内存存储（测试用；不能被其它进程共享）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, PathBuf::from(":memory:"), StoreOptions::default())
    }

    /// 从环境变量 `HIVE_STORE_PATH` 打开（Worker 侧使用）
    pub fn open_from_env() -> Result<Self, StoreError> {
        let path = std::env::var(STORE_PATH_ENV).map_err(|_| {
            StoreError::Corrupt(format!("{} is not set", STORE_PATH_ENV))
        })?;
        Self::open(path, StoreOptions::default())
    }

    fn init(conn: Connection, path: PathBuf, options: StoreOptions) -> Result<Self, StoreError> {
        conn.busy_timeout(options.busy_timeout)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |r| r.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // 超过上限时 SQLite 返回 SQLITE_FULL，映射为 StoreFull
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        let max_pages = (options.max_store_bytes as i64 / page_size.max(1)).max(16);
        let _: i64 = conn.query_row(
            &format!("PRAGMA max_page_count = {}", max_pages),
            [],
            |r| r.get(0),
        )?;

        let integrity: String = conn.query_row("PRAGMA quick_check", [], |r| r.get(0))?;
        if integrity != "ok" {
            return Err(StoreError::Corrupt(integrity));
        }
        conn.execute_batch(SCHEMA).map_err(|e| map_sqlite(e, &path))?;

        tracing::debug!(path = ?path, "store opened");
        Ok(Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                path,
                options,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// 单个值编码后的字节上限
    pub fn max_value_bytes(&self) -> usize {
        self.inner.options.max_value_bytes
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // 连接本身不会因持锁线程 panic 而损坏：未提交的事务随 Transaction drop 回滚
        self.inner
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn encode(&self, key: &str, value: &Value) -> Result<String, StoreError> {
        let body = serde_json::to_string(value)?;
        if body.len() > self.inner.options.max_value_bytes {
            return Err(StoreError::ValueTooLarge {
                key: key.to_string(),
                size: body.len(),
                limit: self.inner.options.max_value_bytes,
            });
        }
        Ok(body)
    }

    fn with_write_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        let out = f(&tx).map_err(|e| remap(e, &self.inner.path))?;
        tx.commit().map_err(|e| map_sqlite(e, &self.inner.path))?;
        Ok(out)
    }

    fn with_read_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Deferred)
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        let out = f(&tx).map_err(|e| remap(e, &self.inner.path))?;
        tx.commit().map_err(|e| map_sqlite(e, &self.inner.path))?;
        Ok(out)
    }

    /// 读取键值；不存在时返回 NotFound
    pub fn read(&self, key: &str) -> Result<Value, StoreError> {
        self.get(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// 读取键值；不存在时返回 None
    pub fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.read_record_opt(key)?.map(|r| r.value))
    }

    /// 读取并反序列化为具体类型
    pub fn read_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, StoreError> {
        let value = self.read(key)?;
        serde_json::from_value(value).map_err(|e| StoreError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn read_record(&self, key: &str) -> Result<StoreRecord, StoreError> {
        self.read_record_opt(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn read_record_opt(&self, key: &str) -> Result<Option<StoreRecord>, StoreError> {
        validate_key(key)?;
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT value, version, updated_at FROM records WHERE key = ?1",
                params![key],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        drop(conn);
        row.map(|(body, version, updated_at)| {
            Ok(StoreRecord {
                key: key.to_string(),
                value: decode(key, &body)?,
                version: version as Version,
                updated_at,
            })
        })
        .transpose()
    }

    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        validate_key(key)?;
        let conn = self.conn();
        let found: Option<i64> = conn
            .query_row("SELECT 1 FROM records WHERE key = ?1", params![key], |r| r.get(0))
            .optional()
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        Ok(found.is_some())
    }

    /// 在同一个读事务内读取多个键（不存在的键不出现在结果中）
    pub fn read_many(&self, keys: &[String]) -> Result<Vec<(String, Value)>, StoreError> {
        for key in keys {
            validate_key(key)?;
        }
        self.with_read_tx(|tx| {
            let mut stmt = tx.prepare_cached("SELECT value FROM records WHERE key = ?1")?;
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                let body: Option<String> = stmt
                    .query_row(params![key], |r| r.get(0))
                    .optional()?;
                if let Some(body) = body {
                    out.push((key.clone(), decode(key, &body)?));
                }
            }
            Ok(out)
        })
    }

    /// 写入（覆盖）键值：值、版本号递增在同一事务内提交
    pub fn write(&self, key: &str, value: &Value) -> Result<Version, StoreError> {
        validate_key(key)?;
        let body = self.encode(key, value)?;
        let version = self.with_write_tx(|tx| put(tx, key, &body))?;
        tracing::debug!(key = %key, version, "store write");
        Ok(version)
    }

    /// 序列化后写入
    pub fn write_as<T: Serialize>(&self, key: &str, value: &T) -> Result<Version, StoreError> {
        let value = serde_json::to_value(value)?;
        self.write(key, &value)
    }

    /// 写入原始 JSON 文本；不是合法 JSON 时拒绝，不会落盘
    pub fn write_raw(&self, key: &str, raw: &str) -> Result<Version, StoreError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| StoreError::InvalidValue {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        self.write(key, &value)
    }

    /// 仅创建：键已存在且内容相同则视为成功并返回现有版本，内容不同返回 AlreadyExists
    pub fn create(&self, key: &str, value: &Value) -> Result<Version, StoreError> {
        validate_key(key)?;
        let body = self.encode(key, value)?;
        self.with_write_tx(|tx| {
            let existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT value, version FROM records WHERE key = ?1",
                    params![key],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            match existing {
                Some((current, version)) => {
                    if decode(key, &current)? == *value {
                        Ok(version as Version)
                    } else {
                        Err(StoreError::AlreadyExists(key.to_string()))
                    }
                }
                None => put(tx, key, &body),
            }
        })
    }

    /// 批量写入：全部成功或全部不生效
    pub fn write_batch(&self, entries: &[(String, Value)]) -> Result<Vec<Version>, StoreError> {
        let mut bodies = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            validate_key(key)?;
            bodies.push(self.encode(key, value)?);
        }
        self.with_write_tx(|tx| {
            entries
                .iter()
                .zip(bodies.iter())
                .map(|((key, _), body)| put(tx, key, body))
                .collect()
        })
    }

    /// 删除键；不存在时返回 NotFound
    pub fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.with_write_tx(|tx| {
            let removed = tx.execute("DELETE FROM records WHERE key = ?1", params![key])?;
            if removed == 0 {
                return Err(StoreError::NotFound(key.to_string()));
            }
            next_revision(tx)?;
            Ok(())
        })
    }

    /// 列出以 prefix 开头的所有键（按字典序）
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        keys::validate_prefix(prefix)?;
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT key FROM records WHERE key >= ?1 AND key < ?2 ORDER BY key")
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        let rows = stmt
            .query_map(params![prefix, keys::prefix_upper_bound(prefix)], |r| r.get(0))
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        rows.collect::<Result<Vec<String>, _>>()
            .map_err(|e| map_sqlite(e, &self.inner.path))
    }

    /// 游标范围扫描：前缀内、`[start, end)` 区间、最多 limit 条
    ///
    /// start / end 为完整键，None 表示不限；与前缀范围取交集。
    pub fn scan(
        &self,
        prefix: &str,
        start: Option<&str>,
        end: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        keys::validate_prefix(prefix)?;
        let upper = keys::prefix_upper_bound(prefix);
        let lo = match start {
            Some(s) if s > prefix => s.to_string(),
            _ => prefix.to_string(),
        };
        let hi = match end {
            Some(e) if e < upper.as_str() => e.to_string(),
            _ => upper,
        };
        if lo >= hi || limit == 0 {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached(
                "SELECT key, value FROM records WHERE key >= ?1 AND key < ?2 ORDER BY key LIMIT ?3",
            )
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        let rows = stmt
            .query_map(params![lo, hi, limit as i64], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        let mut out = Vec::new();
        for row in rows {
            let (key, body) = row.map_err(|e| map_sqlite(e, &self.inner.path))?;
            let value = decode(&key, &body)?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// 前缀内所有键的版本号（watch 轮询使用）
    pub(crate) fn versions(&self, prefix: &str) -> Result<Vec<(String, Version)>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare_cached("SELECT key, version FROM records WHERE key >= ?1 AND key < ?2")
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        let rows = stmt
            .query_map(params![prefix, keys::prefix_upper_bound(prefix)], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as Version))
            })
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlite(e, &self.inner.path))
    }

    /// 当前全局版本号
    pub fn max_version(&self) -> Result<Version, StoreError> {
        let conn = self.conn();
        let v: i64 = conn
            .query_row("SELECT value FROM meta WHERE name = 'revision'", [], |r| r.get(0))
            .map_err(|e| map_sqlite(e, &self.inner.path))?;
        Ok(v as Version)
    }

    /// 创建一个轮询式 watch：初始快照在此刻建立，之后的变更才会产出
    pub fn watch(
        &self,
        pattern: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Watch, StoreError> {
        Watch::new(self.clone(), WatchPattern::new(pattern)?, timeout, poll_interval)
    }
}

fn next_revision(tx: &Transaction<'_>) -> Result<Version, StoreError> {
    tx.execute("UPDATE meta SET value = value + 1 WHERE name = 'revision'", [])?;
    let v: i64 = tx.query_row("SELECT value FROM meta WHERE name = 'revision'", [], |r| r.get(0))?;
    Ok(v as Version)
}

fn put(tx: &Transaction<'_>, key: &str, body: &str) -> Result<Version, StoreError> {
    let version = next_revision(tx)?;
    tx.execute(
        "INSERT INTO records (key, value, version, updated_at) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            version = excluded.version,
            updated_at = excluded.updated_at",
        params![key, body, version as i64, chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(version)
}

fn decode(key: &str, body: &str) -> Result<Value, StoreError> {
    serde_json::from_str(body)
        .map_err(|e| StoreError::Corrupt(format!("record '{}' is not valid JSON: {}", key, e)))
}

fn map_sqlite(err: rusqlite::Error, path: &Path) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => StoreError::StoreFull {
            path: path.to_path_buf(),
        },
        Some(ErrorCode::DatabaseCorrupt) | Some(ErrorCode::NotADatabase) => {
            StoreError::Corrupt(err.to_string())
        }
        _ => StoreError::Sqlite(err),
    }
}

fn remap(err: StoreError, path: &Path) -> StoreError {
    match err {
        StoreError::Sqlite(e) => map_sqlite(e, path),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store(max_store_bytes: u64) -> (tempfile::TempDir, SharedStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStore::open(
            dir.path().join("store.db"),
            StoreOptions {
                max_value_bytes: 64 * 1024,
                max_store_bytes,
                busy_timeout: Duration::from_millis(500),
            },
        )
        .unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_read_delete() {
        let store = SharedStore::open_in_memory().unwrap();
        let v1 = store.write("/a/b", &json!({"x": 1})).unwrap();
        assert_eq!(store.read("/a/b").unwrap(), json!({"x": 1}));

        let v2 = store.write("/a/b", &json!({"x": 2})).unwrap();
        assert!(v2 > v1);
        assert_eq!(store.read_record("/a/b").unwrap().version, v2);

        store.delete("/a/b").unwrap();
        assert!(matches!(store.read("/a/b"), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("/a/b"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_list_is_prefix_scoped_and_sorted() {
        let store = SharedStore::open_in_memory().unwrap();
        for k in ["/p/tasks/b", "/p/tasks/a", "/p/tasksx", "/q/tasks/a"] {
            store.write(k, &json!(k)).unwrap();
        }
        assert_eq!(store.list("/p/tasks/").unwrap(), vec!["/p/tasks/a", "/p/tasks/b"]);
        assert_eq!(store.list("/p/").unwrap().len(), 3);
    }

    #[test]
    fn test_scan_range_and_limit() {
        let store = SharedStore::open_in_memory().unwrap();
        for i in 0..10 {
            store.write(&format!("/log/{:03}", i), &json!(i)).unwrap();
        }
        let page = store.scan("/log/", Some("/log/003"), Some("/log/007"), 100).unwrap();
        let keys: Vec<_> = page.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["/log/003", "/log/004", "/log/005", "/log/006"]);

        let limited = store.scan("/log/", None, None, 3).unwrap();
        assert_eq!(limited.len(), 3);
        assert_eq!(limited[0].1, json!(0));

        assert!(store.scan("/log/", Some("/log/009"), Some("/log/001"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_create_is_write_once() {
        let store = SharedStore::open_in_memory().unwrap();
        let v = store.create("/brief/t1", &json!({"objective": "x"})).unwrap();
        assert_eq!(store.create("/brief/t1", &json!({"objective": "x"})).unwrap(), v);
        let err = store.create("/brief/t1", &json!({"objective": "y"})).unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(store.read("/brief/t1").unwrap(), json!({"objective": "x"}));
    }

    #[test]
    fn test_oversized_value_never_persists() {
        let (_dir, store) = temp_store(16 * 1024 * 1024);
        let big = "x".repeat(70 * 1024);
        let before = store.max_version().unwrap();
        let err = store.write("/big", &json!(big)).unwrap_err();
        assert!(matches!(err, StoreError::ValueTooLarge { .. }));
        assert!(err.is_write_error());
        assert!(!store.exists("/big").unwrap());
        assert_eq!(store.max_version().unwrap(), before);
    }

    #[test]
    fn test_invalid_raw_value_rejected() {
        let store = SharedStore::open_in_memory().unwrap();
        let err = store.write_raw("/k", "{not json").unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));
        assert!(!store.exists("/k").unwrap());
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let store = SharedStore::open_in_memory().unwrap();
        let entries = vec![
            ("/ok/1".to_string(), json!(1)),
            ("bad key".to_string(), json!(2)),
        ];
        assert!(store.write_batch(&entries).is_err());
        assert!(!store.exists("/ok/1").unwrap());

        let entries = vec![("/ok/1".to_string(), json!(1)), ("/ok/2".to_string(), json!(2))];
        let versions = store.write_batch(&entries).unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[1] > versions[0]);
    }

    #[test]
    fn test_store_full_fails_fast() {
        let (_dir, store) = temp_store(80 * 1024);
        let chunk = "y".repeat(30 * 1024);
        let mut saw_full = false;
        for i in 0..20 {
            match store.write(&format!("/fill/{}", i), &json!(chunk)) {
                Ok(_) => {}
                Err(StoreError::StoreFull { .. }) => {
                    saw_full = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(saw_full);
    }

    #[test]
    fn test_reopen_persists_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let store = SharedStore::open(&path, StoreOptions::default()).unwrap();
            store.write("/persist/me", &json!({"ok": true})).unwrap();
        }
        let store = SharedStore::open(&path, StoreOptions::default()).unwrap();
        assert_eq!(store.read("/persist/me").unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_read_many_skips_missing() {
        let store = SharedStore::open_in_memory().unwrap();
        store.write("/m/a", &json!("a")).unwrap();
        let got = store
            .read_many(&["/m/a".to_string(), "/m/missing".to_string()])
            .unwrap();
        assert_eq!(got, vec![("/m/a".to_string(), json!("a"))]);
    }
}
