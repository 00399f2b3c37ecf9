//! 轮询式变更通知
//!
//! 只是一个便利机制，不是可靠投递的事件总线：两次轮询之间的中间状态会被合并或丢失，
//! 调用方拿到事件后应重新 `read` 获取当前真值。无变化时轮询间隔指数退避，
//! 到达硬超时后序列结束。

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use futures_util::Stream;
use glob::{MatchOptions, Pattern};
use tokio::time::Instant;

use crate::store::{SharedStore, StoreError, Version};

/// 变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// 单个变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub key: String,
    /// 删除事件没有新版本号
    pub version: Option<Version>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// watch 键模式
///
/// `*` 只匹配单个路径段，`**` 可跨段。以 `/projects/` 开头的模式按完整键匹配，
/// 其它模式按「从某个段边界开始的后缀」匹配，所以 `/tasks/*` 能匹配
/// `/projects/p/tasks/x`。
#[derive(Debug, Clone)]
pub struct WatchPattern {
    raw: String,
    pattern: Pattern,
    absolute: bool,
    /// SQL 预过滤用的字面前缀
    prefix: String,
}

impl WatchPattern {
    pub fn new(raw: &str) -> Result<Self, StoreError> {
        if !raw.starts_with('/') {
            return Err(StoreError::InvalidKey {
                key: raw.to_string(),
                reason: "watch pattern must start with '/'".to_string(),
            });
        }
        let pattern = Pattern::new(raw).map_err(|e| StoreError::InvalidKey {
            key: raw.to_string(),
            reason: e.to_string(),
        })?;
        let absolute = raw.starts_with("/projects/");
        let prefix = if absolute {
            let literal_end = raw.find(&['*', '?', '['][..]).unwrap_or(raw.len());
            let literal = &raw[..literal_end];
            match literal.rfind('/') {
                Some(idx) if literal_end < raw.len() => literal[..=idx].to_string(),
                _ => literal.to_string(),
            }
        } else {
            String::new()
        };
        Ok(Self {
            raw: raw.to_string(),
            pattern,
            absolute,
            prefix,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, key: &str) -> bool {
        if self.pattern.matches_with(key, MATCH_OPTIONS) {
            return true;
        }
        if self.absolute {
            return false;
        }
        key.char_indices()
            .filter(|(i, c)| *c == '/' && *i > 0)
            .any(|(i, _)| self.pattern.matches_with(&key[i..], MATCH_OPTIONS))
    }
}

/// 一次 watch 的惰性、有限事件序列
pub struct Watch {
    store: SharedStore,
    pattern: WatchPattern,
    snapshot: BTreeMap<String, Version>,
    pending: VecDeque<ChangeEvent>,
    deadline: Instant,
    base_interval: Duration,
    backoff: Duration,
    max_backoff: Duration,
    finished: bool,
}

impl Watch {
    pub(crate) fn new(
        store: SharedStore,
        pattern: WatchPattern,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let base_interval = poll_interval.max(Duration::from_millis(1));
        let mut watch = Self {
            store,
            pattern,
            snapshot: BTreeMap::new(),
            pending: VecDeque::new(),
            deadline: Instant::now() + timeout,
            base_interval,
            backoff: base_interval,
            max_backoff: base_interval * 16,
            finished: false,
        };
        watch.snapshot = watch.current()?;
        Ok(watch)
    }

    /// 设置退避上限（默认为轮询间隔的 16 倍）
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff.max(self.base_interval);
        self
    }

    pub fn pattern(&self) -> &WatchPattern {
        &self.pattern
    }

    fn current(&self) -> Result<BTreeMap<String, Version>, StoreError> {
        Ok(self
            .store
            .versions(&self.pattern.prefix)?
            .into_iter()
            .filter(|(k, _)| self.pattern.matches(k))
            .collect())
    }

    /// 轮询一次，将差异追加到 pending；返回新增事件数
    fn poll(&mut self) -> Result<usize, StoreError> {
        let now = self.current()?;
        let mut changes = 0;
        for (key, version) in &now {
            let kind = match self.snapshot.get(key) {
                None => Some(ChangeKind::Created),
                Some(old) if old != version => Some(ChangeKind::Modified),
                _ => None,
            };
            if let Some(kind) = kind {
                self.pending.push_back(ChangeEvent {
                    kind,
                    key: key.clone(),
                    version: Some(*version),
                });
                changes += 1;
            }
        }
        for key in self.snapshot.keys() {
            if !now.contains_key(key) {
                self.pending.push_back(ChangeEvent {
                    kind: ChangeKind::Deleted,
                    key: key.clone(),
                    version: None,
                });
                changes += 1;
            }
        }
        self.snapshot = now;
        Ok(changes)
    }

    /// 下一个变更；超时后返回 None（之后一直返回 None）
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                return Some(ev);
            }
            let now = Instant::now();
            if self.finished || now >= self.deadline {
                self.finished = true;
                return None;
            }
            let wait = self.backoff.min(self.deadline - now);
            tokio::time::sleep(wait).await;
            match self.poll() {
                Ok(0) => self.backoff = (self.backoff * 2).min(self.max_backoff),
                Ok(n) => {
                    tracing::debug!(pattern = %self.pattern.as_str(), changes = n, "watch poll");
                    self.backoff = self.base_interval;
                }
                Err(e) => {
                    tracing::warn!(pattern = %self.pattern.as_str(), "watch poll failed: {}", e);
                    self.finished = true;
                }
            }
        }
    }

    /// 收集到超时为止的全部事件
    pub async fn collect_all(mut self) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        while let Some(ev) = self.next().await {
            out.push(ev);
        }
        out
    }

    /// 转为 `Stream`
    pub fn into_stream(self) -> impl Stream<Item = ChangeEvent> {
        futures_util::stream::unfold(self, |mut watch| async move {
            watch.next().await.map(|ev| (ev, watch))
        })
    }
}
