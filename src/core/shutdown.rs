//! 关闭处理
//!
//! 统一的关闭信号：所有循环监听同一个 CancellationToken。第一次触发的原因被保留下来，
//! 供入口进程决定退出码（版本不一致 / 致命错误 / 用户请求）。
//! 关闭时由 ShutdownCoordinator 依次执行清理任务（如把会话与承诺状态落盘）。

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// 关闭管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    first_reason: Arc<Mutex<Option<ShutdownReason>>>,
}

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// 调用方主动 stop()
    Requested,
    /// Ctrl+C / SIGTERM
    Signal,
    /// 远端部署版本与本进程不一致
    VersionMismatch { local: String, remote: String },
    /// 致命错误（认证失败等）
    Fatal(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            shutdown_token: CancellationToken::new(),
            first_reason: Arc::new(Mutex::new(None)),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// 触发关闭；只有第一次的原因会被记录
    pub fn shutdown(&self, reason: ShutdownReason) {
        {
            let mut first = self.first_reason.lock().unwrap_or_else(|e| e.into_inner());
            if first.is_none() {
                tracing::info!(?reason, "Shutdown requested");
                *first = Some(reason.clone());
            }
        }
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.first_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)，须在 tokio 运行时内调用
    ///
    /// SIGTERM 监听在返回前注册完成，之后到达的信号不会再按默认行为杀死进程。
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                manager.shutdown(ShutdownReason::Signal);
            }
        });

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        if sigterm.recv().await.is_some() {
                            tracing::info!("Received SIGTERM, initiating graceful shutdown");
                            manager.shutdown(ShutdownReason::Signal);
                        }
                    });
                }
                Err(e) => tracing::warn!(error = %e, "Could not install SIGTERM handler"),
            }
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，每个任务有独立超时
pub struct ShutdownCoordinator {
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register(&mut self, task: Arc<dyn ShutdownCleanup>) {
        self.cleanup_tasks.push(task);
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
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
        manager.shutdown(ShutdownReason::Requested);
        assert!(token.is_cancelled());
        assert!(manager.is_shutdown());
    }

    #[test]
    fn test_first_reason_wins() {
        let manager = ShutdownManager::new();
        manager.shutdown(ShutdownReason::VersionMismatch {
            local: "0.1.0".into(),
            remote: "0.2.0".into(),
        });
        manager.shutdown(ShutdownReason::Requested);
        assert!(matches!(
            manager.reason(),
            Some(ShutdownReason::VersionMismatch { .. })
        ));
    }

    struct MockCleanup {
        called: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl ShutdownCleanup for MockCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "MockCleanup"
        }
    }

    struct StuckCleanup;

    #[async_trait::async_trait]
    impl ShutdownCleanup for StuckCleanup {
        async fn cleanup(&self) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "StuckCleanup"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_cleanup_times_out_and_later_tasks_run() {
        let mut coordinator = ShutdownCoordinator::new().with_timeout(2);
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Arc::new(StuckCleanup));
        coordinator.register(Arc::new(MockCleanup { called: called.clone() }));

        let started = tokio::time::Instant::now();
        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
        assert!(started.elapsed() >= std::time::Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_triggers_signal_shutdown() {
        let manager = ShutdownManager::new();
        manager.install_signal_handlers();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(std::time::Duration::from_secs(5), manager.wait_for_shutdown())
            .await
            .unwrap();
        assert_eq!(manager.reason(), Some(ShutdownReason::Signal));
    }

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let mut coordinator = ShutdownCoordinator::new();
        let called = Arc::new(AtomicBool::new(false));
        coordinator.register(Arc::new(MockCleanup { called: called.clone() }));
        coordinator.run_cleanup().await;
        assert!(called.load(Ordering::SeqCst));
    }
}
