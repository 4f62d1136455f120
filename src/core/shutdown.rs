//! 优雅关闭
//!
//! ShutdownManager 监听 Ctrl+C / SIGTERM 并记录关闭原因；ShutdownCoordinator 在限定时间内依次执行
//! 注册的清理任务（主要是关闭 MCP 会话：停止心跳与目录刷新、关闭传输）。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::mcp::SessionManager;

/// 关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C 或 CLI 的退出命令
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 输入流结束
    InputClosed,
}

/// 关闭信号：第一次 shutdown 的原因会被保留，之后的调用只是幂等地取消 token
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            slot.get_or_insert(reason);
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| *r)
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM（unix）
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl+C received, shutting down");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        info!("SIGTERM received, shutting down");
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => warn!(error = %e, "SIGTERM handler not installed"),
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 关闭 MCP 会话（cleanup 本身从不失败）
pub struct SessionCleanup {
    session: SessionManager,
}

impl SessionCleanup {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SessionCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.session.set_auto_reconnect(false);
        self.session.cleanup().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "McpSession"
    }
}

/// 关闭协调器：按注册顺序执行清理，每个任务单独限时
pub struct ShutdownCoordinator {
    manager: ShutdownManager,
    tasks: Vec<Box<dyn ShutdownCleanup>>,
    per_task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: ShutdownManager) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            per_task_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.tasks.push(Box::new(task));
    }

    /// 执行全部清理；单个任务失败或超时只记日志，不影响后续任务
    pub async fn run_cleanup(&self) {
        info!(reason = ?self.manager.reason(), tasks = self.tasks.len(), "running shutdown cleanup");
        for task in &self.tasks {
            match tokio::time::timeout(self.per_task_timeout, task.cleanup()).await {
                Ok(Ok(())) => info!(task = task.name(), "cleanup done"),
                Ok(Err(e)) => warn!(task = task.name(), error = %e, "cleanup failed"),
                Err(_) => warn!(task = task.name(), timeout_ms = self.per_task_timeout.as_millis() as u64, "cleanup timed out"),
            }
        }
    }
}
