//! 优雅关闭
//!
//! Ctrl+C / SIGTERM 触发关闭 token；HTTP 服务随 token 退出，
//! 随后协调器依次执行清理（停止全部监视会话、落盘快照、关闭浏览器）。
//! 任务状态不在关闭时改写，下次启动会自动恢复。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::orchestrator::Orchestrator;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// HTTP 服务异常退出等
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    /// 关闭 token（交给服务器的 graceful shutdown）
    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 日志用名称
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理，每项有超时
pub struct ShutdownCoordinator {
    reasons: broadcast::Receiver<ShutdownReason>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: &ShutdownManager) -> Self {
        Self {
            reasons: manager.subscribe(),
            cleanup_tasks: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 执行全部清理；返回触发关闭的原因（服务自行退出时为 None）
    pub async fn run_cleanup(&mut self) -> Option<ShutdownReason> {
        let reason = self.reasons.try_recv().ok();
        tracing::info!(
            reason = ?reason,
            "Running {} cleanup tasks...",
            self.cleanup_tasks.len()
        );

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(self.timeout, task.cleanup()).await {
                Ok(Ok(())) => tracing::info!("Cleanup task '{}' completed", name),
                Ok(Err(e)) => tracing::warn!("Cleanup task '{}' failed: {}", name, e),
                Err(_) => tracing::warn!("Cleanup task '{}' timed out after {:?}", name, self.timeout),
            }
        }

        tracing::info!("All cleanup tasks finished");
        reason
    }
}

/// 编排器清理：停止监视会话、最终落盘、关闭会话宿主
pub struct OrchestratorCleanup {
    orchestrator: Orchestrator,
}

impl OrchestratorCleanup {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for OrchestratorCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.orchestrator.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Orchestrator"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_shutdown_manager_token() {
        let manager = ShutdownManager::new();
        let token = manager.token();
        assert!(!token.is_cancelled());
        manager.shutdown(ShutdownReason::UserInitiated);
        assert!(token.is_cancelled());
    }

    struct FlagCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for FlagCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Flag"
        }
    }

    struct SlowCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for SlowCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "Slow"
        }
    }

    #[tokio::test]
    async fn test_coordinator_runs_past_timeouts() {
        let manager = ShutdownManager::new();
        let mut coordinator =
            ShutdownCoordinator::new(&manager).with_timeout(Duration::from_millis(20));

        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(SlowCleanup);
        coordinator.register(FlagCleanup {
            called: called.clone(),
        });

        manager.shutdown(ShutdownReason::FatalError("listener closed".to_string()));
        let reason = coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
        assert_eq!(
            reason,
            Some(ShutdownReason::FatalError("listener closed".to_string()))
        );
    }

    #[tokio::test]
    async fn test_cleanup_without_signal_has_no_reason() {
        let manager = ShutdownManager::new();
        let mut coordinator = ShutdownCoordinator::new(&manager);
        assert!(coordinator.run_cleanup().await.is_none());
    }
}
