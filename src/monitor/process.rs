//! 单个 Worker 子进程的句柄与后台采集任务

use std::collections::VecDeque;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{MonitorError, SpawnRequest};

const EVENT_BUFFER: usize = 256;

/// 进程退出后，输出管道连续这么久没有新行就放弃读取（孙进程可能继续持有管道）
const READER_DRAIN: Duration = Duration::from_millis(500);

/// 后台读取任务及其已交付的行数
struct Reader {
    join: JoinHandle<()>,
    delivered: Arc<AtomicU64>,
}

impl Reader {
    /// 只要还在交付新行就继续等；停滞超过 READER_DRAIN 才中止
    async fn drain(mut self) {
        loop {
            let before = self.delivered.load(Ordering::Relaxed);
            match tokio::time::timeout(READER_DRAIN, &mut self.join).await {
                Ok(_) => return,
                Err(_) if self.delivered.load(Ordering::Relaxed) != before => continue,
                Err(_) => {
                    tracing::debug!("output reader stalled after exit, aborting");
                    self.join.abort();
                    return;
                }
            }
        }
    }
}

/// 进程退出信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// 被信号终止时的信号编号（仅 unix）
    pub signal: Option<i32>,
    pub success: bool,
}

impl ExitInfo {
    /// 无法得知退出状态（监控任务提前结束）
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
            success: false,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
            success: status.success(),
        }
    }
}

/// Worker 进程生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum WorkerStatus {
    Spawning,
    Running,
    Exited(ExitInfo),
}

/// 监控事件：stdout 的一行，或进程退出（总是最后一个）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    Line(String),
    Exited(ExitInfo),
}

/// 可克隆的终止器，供事件循环之外的调用方使用
#[derive(Debug, Clone)]
pub struct WorkerTerminator {
    pid: Option<u32>,
    tx: mpsc::Sender<Duration>,
    status: watch::Receiver<WorkerStatus>,
}

impl WorkerTerminator {
    /// 先发送优雅停止信号，等待 grace 后强杀；返回最终退出信息
    ///
    /// 进程已经退出时直接返回已有的退出信息。
    pub async fn terminate(&self, grace: Duration) -> Result<ExitInfo, MonitorError> {
        // 容量为 1：已有请求在排队时无需重复发送
        let _ = self.tx.try_send(grace);
        tracing::debug!(pid = ?self.pid, grace_ms = grace.as_millis() as u64, "terminate requested");
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| matches!(s, WorkerStatus::Exited(_)))
            .await
            .map_err(|_| {
                MonitorError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "monitor task ended without exit status",
                ))
            })?;
        match *status {
            WorkerStatus::Exited(info) => Ok(info),
            _ => Ok(ExitInfo::unknown()),
        }
    }
}

/// 运行中的 Worker 句柄
pub struct WorkerHandle {
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    events: mpsc::Receiver<MonitorEvent>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    terminator: WorkerTerminator,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("status", &self.status())
            .finish()
    }
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn status(&self) -> WorkerStatus {
        *self.terminator.status.borrow()
    }

    /// 最近若干行 stderr
    pub fn stderr_tail(&self) -> Vec<String> {
        lock_tail(&self.stderr_tail).iter().cloned().collect()
    }

    /// 下一个事件；进程退出且输出读完后返回 None
    pub async fn next_event(&mut self) -> Option<MonitorEvent> {
        self.events.recv().await
    }

    /// 以 `Stream` 形式消费事件
    pub fn into_stream(self) -> impl Stream<Item = MonitorEvent> {
        futures_util::stream::unfold(self, |mut handle| async move {
            handle.next_event().await.map(|ev| (ev, handle))
        })
    }

    pub fn terminator(&self) -> WorkerTerminator {
        self.terminator.clone()
    }

    pub async fn terminate(&self, grace: Duration) -> Result<ExitInfo, MonitorError> {
        self.terminator.terminate(grace).await
    }
}

fn lock_tail(tail: &Mutex<VecDeque<String>>) -> std::sync::MutexGuard<'_, VecDeque<String>> {
    tail.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(super) async fn spawn(
    request: SpawnRequest,
    spawn_check: Duration,
    tail_lines: usize,
    max_line_bytes: usize,
) -> Result<WorkerHandle, MonitorError> {
    let mut cmd = Command::new(&request.command);
    cmd.args(&request.args)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &request.current_dir {
        cmd.current_dir(dir);
    }
    // 独立进程组：终止时连同孙进程一起处理，终端 Ctrl+C 也不会直接打到 Worker
    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => MonitorError::BinaryNotFound {
            command: request.command.clone(),
        },
        _ => MonitorError::Launch {
            command: request.command.clone(),
            source: e,
        },
    })?;
    let pid = child.id();
    let started_at = Utc::now();

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stdout not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "worker stderr not captured"))?;

    let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
    let (status_tx, status_rx) = watch::channel(WorkerStatus::Spawning);
    let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(tail_lines)));

    let stdout_delivered = Arc::new(AtomicU64::new(0));
    let stderr_delivered = Arc::new(AtomicU64::new(0));
    let stdout_task = tokio::spawn(read_stdout(
        stdout,
        event_tx.clone(),
        max_line_bytes.max(1),
        stdout_delivered.clone(),
    ));
    let stderr_task = tokio::spawn(read_stderr(
        stderr,
        stderr_tail.clone(),
        tail_lines,
        pid,
        stderr_delivered.clone(),
    ));

    let early = match tokio::time::timeout(spawn_check, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => return Err(MonitorError::Io(e)),
        Err(_) => None,
    };
    if let Some(status) = early {
        if !status.success() {
            let _ = tokio::time::timeout(READER_DRAIN, stderr_task).await;
            stdout_task.abort();
            let stderr = lock_tail(&stderr_tail).iter().cloned().collect::<Vec<_>>().join("\n");
            tracing::warn!(
                command = %request.command,
                pid = ?pid,
                code = ?status.code(),
                "worker exited immediately"
            );
            return Err(MonitorError::ExitedImmediately {
                code: status.code(),
                stderr,
            });
        }
    }

    status_tx.send_replace(WorkerStatus::Running);
    let (term_tx, term_rx) = mpsc::channel(1);
    tokio::spawn(supervise(
        child,
        pid,
        early,
        term_rx,
        [
            Reader {
                join: stdout_task,
                delivered: stdout_delivered,
            },
            Reader {
                join: stderr_task,
                delivered: stderr_delivered,
            },
        ],
        event_tx,
        status_tx,
    ));

    tracing::debug!(command = %request.command, pid = ?pid, "worker spawned");
    Ok(WorkerHandle {
        pid,
        started_at,
        events: event_rx,
        stderr_tail,
        terminator: WorkerTerminator {
            pid,
            tx: term_tx,
            status: status_rx,
        },
    })
}

/// 等待进程退出（或终止请求），读完输出后发送 Exited
async fn supervise(
    mut child: Child,
    pid: Option<u32>,
    early: Option<ExitStatus>,
    mut term_rx: mpsc::Receiver<Duration>,
    readers: [Reader; 2],
    event_tx: mpsc::Sender<MonitorEvent>,
    status_tx: watch::Sender<WorkerStatus>,
) {
    let result = match early {
        Some(status) => Ok(status),
        None => {
            tokio::select! {
                status = child.wait() => status,
                Some(grace) = term_rx.recv() => stop_child(&mut child, pid, grace).await,
            }
        }
    };
    let info = match result {
        Ok(status) => ExitInfo::from(status),
        Err(e) => {
            tracing::warn!(pid = ?pid, "waiting for worker failed: {}", e);
            ExitInfo::unknown()
        }
    };

    for reader in readers {
        reader.drain().await;
    }

    status_tx.send_replace(WorkerStatus::Exited(info));
    tracing::debug!(pid = ?pid, code = ?info.code, signal = ?info.signal, "worker exited");
    let _ = event_tx.send(MonitorEvent::Exited(info)).await;
}

async fn stop_child(child: &mut Child, pid: Option<u32>, grace: Duration) -> io::Result<ExitStatus> {
    if !signal_group(pid, GroupSignal::Terminate) {
        child.start_kill()?;
        return child.wait().await;
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(
                pid = ?pid,
                grace_ms = grace.as_millis() as u64,
                "worker ignored graceful stop, killing"
            );
            if !signal_group(pid, GroupSignal::Kill) {
                let _ = child.start_kill();
            }
            child.wait().await
        }
    }
}

enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        return false;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid, "killpg failed: {}", e);
            false
        }
    }
}

/// 非 unix 平台没有优雅停止信号，直接走强杀
#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) -> bool {
    false
}

fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// 按行读取 stdout；超过 `max_line_bytes` 的行拆成多段依次发送
async fn read_stdout<R: AsyncRead + Unpin>(
    stdout: R,
    tx: mpsc::Sender<MonitorEvent>,
    max_line_bytes: usize,
    delivered: Arc<AtomicU64>,
) {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader).take(max_line_bytes as u64).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.len() >= max_line_bytes && buf.last() != Some(&b'\n') {
                    tracing::debug!(limit = max_line_bytes, "worker stdout line split");
                }
                if tx.send(MonitorEvent::Line(decode_line(&buf))).await.is_err() {
                    break;
                }
                delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::warn!("worker stdout read failed: {}", e);
                break;
            }
        }
    }
}

async fn read_stderr<R: AsyncRead + Unpin>(
    stderr: R,
    tail: Arc<Mutex<VecDeque<String>>>,
    tail_lines: usize,
    pid: Option<u32>,
    delivered: Arc<AtomicU64>,
) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = decode_line(&buf);
                tracing::debug!(pid = ?pid, "worker stderr: {}", line);
                let mut tail = lock_tail(&tail);
                if tail.len() == tail_lines {
                    tail.pop_front();
                }
                tail.push_back(line);
                delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_line_strips_crlf_and_tolerates_bad_utf8() {
        assert_eq!(decode_line(b"hello\r\n"), "hello");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(&[0x66, 0xff, 0x6f, b'\n']), "f\u{fffd}o");
    }

    #[tokio::test]
    async fn test_stderr_tail_is_bounded() {
        let tail = Arc::new(Mutex::new(VecDeque::new()));
        let input: &[u8] = b"a\nb\nc\nd\n";
        read_stderr(input, tail.clone(), 2, None, Arc::new(AtomicU64::new(0))).await;
        let got: Vec<_> = lock_tail(&tail).iter().cloned().collect();
        assert_eq!(got, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_long_stdout_line_is_split_at_limit() {
        let (tx, mut rx) = mpsc::channel(16);
        let input = format!("{}\nshort\n", "a".repeat(10));
        read_stdout(input.as_bytes(), tx, 4, Arc::new(AtomicU64::new(0))).await;
        let mut lines = Vec::new();
        while let Some(MonitorEvent::Line(line)) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["aaaa", "aaaa", "aa", "shor", "t"]);
    }

    #[tokio::test]
    async fn test_slow_consumer_still_receives_every_line() {
        let (tx, mut rx) = mpsc::channel(2);
        let delivered = Arc::new(AtomicU64::new(0));
        let input: Vec<u8> = (0..50).flat_map(|i| format!("{}\n", i).into_bytes()).collect();
        let reader = Reader {
            join: tokio::spawn(read_stdout(std::io::Cursor::new(input), tx, 1024, delivered.clone())),
            delivered,
        };
        let consumer = tokio::spawn(async move {
            let mut n = 0;
            while let Some(MonitorEvent::Line(_)) = rx.recv().await {
                // 总耗时远超 READER_DRAIN
                tokio::time::sleep(Duration::from_millis(60)).await;
                n += 1;
            }
            n
        });
        reader.drain().await;
        assert_eq!(consumer.await.unwrap(), 50);
    }
}
