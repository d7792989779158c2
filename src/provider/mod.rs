//! 外部协作方边界：会话提供者（浏览器标签页）与探测器
//!
//! 编排器只依赖这里的 trait：
//! - `SessionProvider`：按任务分配隔离的浏览会话，调用方负责其生命周期
//! - `BrowserSession`：导航、等待稳定、原地刷新、注入探测器、关闭
//! - `FoundCallback`：探测器回报入口，每个会话实例一个有界通道，重复回报被丢弃
//!
//! 实现：
//! - `chrome`（feature "browser"）：Headless Chrome，每个会话一个 Tab
//! - `mock`：进程内脚本化实现，用于测试与演示

pub mod detector;
pub mod mock;

#[cfg(feature = "browser")]
pub mod chrome;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::WatchError;

pub use detector::{detector_script, probe_script, DetectorParams};
pub use mock::{MockSessionProvider, MockBehavior};

#[cfg(feature = "browser")]
pub use chrome::{ChromeOptions, ChromeProvider};

/// 探测器回报：哪个会话实例、发现了哪个链接
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundReport {
    pub instance: u64,
    pub href: String,
}

/// 探测器回调：绑定到某个会话实例的有界发送端
#[derive(Clone, Debug)]
pub struct FoundCallback {
    instance: u64,
    tx: mpsc::Sender<FoundReport>,
}

impl FoundCallback {
    pub fn new(instance: u64, tx: mpsc::Sender<FoundReport>) -> Self {
        Self { instance, tx }
    }

    /// 回报发现；通道已满或已关闭时静默丢弃（重复回报为 no-op）
    pub fn report(&self, href: impl Into<String>) -> bool {
        self.tx
            .try_send(FoundReport {
                instance: self.instance,
                href: href.into(),
            })
            .is_ok()
    }
}

/// 一个隔离的浏览会话（类似一个标签页）
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// 会话标识（日志用）
    fn id(&self) -> &str;

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), WatchError>;

    /// 等待页面稳定加载；超时返回 false（调用方继续尝试探测）
    async fn wait_stable(&self, timeout: Duration) -> bool;

    /// 原地刷新当前文档（导航失败时的降级路径）
    async fn reload(&self, timeout: Duration) -> Result<(), WatchError>;

    /// 注册发现回调（同名重复注册应幂等）并执行探测脚本
    async fn inject_detector(
        &self,
        params: &DetectorParams,
        on_found: FoundCallback,
    ) -> Result<(), WatchError>;

    /// 尽力从当前页面取回目标链接
    async fn probe_href(&self, params: &DetectorParams) -> Option<String>;

    async fn close(&self);
}

/// 会话提供者
#[async_trait]
pub trait SessionProvider: Send + Sync {
    async fn acquire(&self, task_id: &str) -> Result<Box<dyn BrowserSession>, WatchError>;

    async fn release(&self, session: Box<dyn BrowserSession>) {
        session.close().await;
    }

    /// 释放底层会话宿主（浏览器进程）
    async fn shutdown(&self) {}

    fn name(&self) -> &str;
}

/// 按 `[app] provider` 创建会话提供者；请求的实现未编译进来时报错
pub fn create_provider_from_config(cfg: &AppConfig) -> anyhow::Result<Arc<dyn SessionProvider>> {
    match cfg.app.provider.trim().to_lowercase().as_str() {
        #[cfg(feature = "browser")]
        "chrome" => {
            let b = &cfg.browser;
            tracing::info!(headless = b.headless, "Using Chrome session provider");
            Ok(Arc::new(ChromeProvider::new(ChromeOptions {
                headless: b.headless,
                executable: b.executable.clone(),
                window_size: (b.window_width, b.window_height),
                idle_timeout: Duration::from_secs(b.idle_timeout_secs),
            })))
        }
        #[cfg(not(feature = "browser"))]
        "chrome" => anyhow::bail!(
            "session provider 'chrome' requires the 'browser' feature; rebuild with --features browser or set app.provider = \"mock\""
        ),
        "mock" => {
            tracing::warn!("Using mock session provider, no real pages will be watched");
            Ok(Arc::new(MockSessionProvider::new()))
        }
        other => anyhow::bail!("unknown session provider '{}' (expected chrome or mock)", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_found_callback_drops_duplicates() {
        let (tx, mut rx) = mpsc::channel(1);
        let callback = FoundCallback::new(7, tx);
        assert!(callback.report("https://example.com/a"));
        assert!(!callback.report("https://example.com/b"));

        let report = rx.try_recv().unwrap();
        assert_eq!(report.instance, 7);
        assert_eq!(report.href, "https://example.com/a");
    }

    fn config_with(provider: &str) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.app.provider = provider.to_string();
        cfg
    }

    #[test]
    fn test_create_mock_provider() {
        let provider = create_provider_from_config(&config_with(" Mock ")).unwrap();
        assert_eq!(provider.name(), "mock");
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let err = create_provider_from_config(&config_with("firefox"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("firefox"));
    }

    #[cfg(not(feature = "browser"))]
    #[test]
    fn test_chrome_without_browser_feature_is_rejected() {
        let err = create_provider_from_config(&config_with("chrome"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("browser"));
    }

    #[test]
    fn test_default_provider_is_available_in_this_build() {
        assert!(create_provider_from_config(&AppConfig::default()).is_ok());
    }
}
