//! 会话监管：暂停请求与 Worker 取消
//!
//! 持有会话级 CancellationToken，每个 Worker 的监控任务拿一个子 token；请求暂停即取消
//! 会话 token，所有子 token 随之触发，各自的监控任务负责 terminate 对应的子进程。
//! Ctrl+C / SIGTERM 映射为暂停请求（引擎先写检查点再终止 Worker）。

use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// 暂停原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    /// 通过 API（pause 命令）
    Requested,
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

impl PauseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PauseReason::Requested => "requested",
            PauseReason::Interrupt => "interrupt",
            PauseReason::Terminate => "terminate",
        }
    }
}

/// 会话级生命周期管理：取消令牌与暂停状态
#[derive(Debug)]
pub struct SessionSupervisor {
    cancel_token: CancellationToken,
    paused: Arc<RwLock<Option<PauseReason>>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            paused: Arc::new(RwLock::new(None)),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 请求暂停：记录原因并取消全部 Worker 子 token
    pub async fn request_pause(&self, reason: PauseReason) {
        {
            let mut paused = self.paused.write().await;
            if paused.is_none() {
                *paused = Some(reason);
            }
        }
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub async fn is_paused(&self) -> bool {
        self.paused.read().await.is_some()
    }

    pub async fn pause_reason(&self) -> Option<PauseReason> {
        *self.paused.read().await
    }

    /// 创建子 token（用于单个 Worker）
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, pausing session...");
                supervisor.request_pause(PauseReason::Interrupt).await;
            }
        });

        #[cfg(unix)]
        {
            let supervisor = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, pausing session...");
                    supervisor.request_pause(PauseReason::Terminate).await;
                }
            });
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
