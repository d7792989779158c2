//! Mock 会话提供者（用于测试，无需浏览器）
//!
//! 记录每个任务的导航 / 刷新 / 注入次数与同时打开的会话数，
//! 并可通过 `trigger_found` 模拟探测器回报。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{BrowserSession, DetectorParams, FoundCallback, SessionProvider};
use crate::core::WatchError;

/// 可在运行时切换的行为开关
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub fail_acquire: bool,
    pub fail_navigation: bool,
    pub fail_injection: bool,
    /// wait_stable 返回超时
    pub never_stable: bool,
    pub acquire_delay: Duration,
    /// 注入后立即回报的链接
    pub auto_found: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    navigations: usize,
    reloads: usize,
    injections: usize,
}

struct OpenSession {
    task_id: String,
    callback: Option<FoundCallback>,
}

#[derive(Default)]
struct MockState {
    behavior: MockBehavior,
    open: HashMap<String, OpenSession>,
    /// 打开顺序（触发回报时取最新的会话）
    open_order: Vec<String>,
    max_open: usize,
    acquired: usize,
    closed: usize,
    counters: HashMap<String, Counters>,
    page_hrefs: HashMap<String, String>,
    failing_urls: Vec<String>,
}

impl MockState {
    fn counters(&mut self, task_id: &str) -> &mut Counters {
        self.counters.entry(task_id.to_string()).or_default()
    }
}

/// Mock 提供者
#[derive(Clone, Default)]
pub struct MockSessionProvider {
    state: Arc<Mutex<MockState>>,
    next_id: Arc<AtomicU64>,
}

impl MockSessionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: MockBehavior) -> Self {
        let provider = Self::default();
        provider.set_behavior(behavior);
        provider
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        self.lock().behavior = behavior;
    }

    /// 指定 URL 的导航始终失败
    pub fn fail_navigation_for(&self, url: &str) {
        self.lock().failing_urls.push(url.to_string());
    }

    /// probe_href 返回的页面链接
    pub fn set_page_href(&self, task_id: &str, href: &str) {
        self.lock()
            .page_hrefs
            .insert(task_id.to_string(), href.to_string());
    }

    /// 模拟探测器回报：调用该任务最新打开会话的回调
    pub fn trigger_found(&self, task_id: &str, href: &str) -> bool {
        let callback = {
            let state = self.lock();
            state
                .open_order
                .iter()
                .rev()
                .filter_map(|sid| state.open.get(sid))
                .find(|s| s.task_id == task_id && s.callback.is_some())
                .and_then(|s| s.callback.clone())
        };
        match callback {
            Some(cb) => {
                cb.report(href);
                true
            }
            None => false,
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.lock().open.len()
    }

    pub fn open_sessions_for(&self, task_id: &str) -> usize {
        self.lock()
            .open
            .values()
            .filter(|s| s.task_id == task_id)
            .count()
    }

    /// 历史最高同时打开数
    pub fn max_open(&self) -> usize {
        self.lock().max_open
    }

    pub fn total_acquired(&self) -> usize {
        self.lock().acquired
    }

    pub fn total_closed(&self) -> usize {
        self.lock().closed
    }

    pub fn navigations(&self, task_id: &str) -> usize {
        self.lock().counters.get(task_id).map(|c| c.navigations).unwrap_or(0)
    }

    pub fn reloads(&self, task_id: &str) -> usize {
        self.lock().counters.get(task_id).map(|c| c.reloads).unwrap_or(0)
    }

    pub fn injections(&self, task_id: &str) -> usize {
        self.lock().counters.get(task_id).map(|c| c.injections).unwrap_or(0)
    }

    /// 导航 + 刷新 + 注入总次数
    pub fn activity(&self, task_id: &str) -> usize {
        self.lock()
            .counters
            .get(task_id)
            .map(|c| c.navigations + c.reloads + c.injections)
            .unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SessionProvider for MockSessionProvider {
    async fn acquire(&self, task_id: &str) -> Result<Box<dyn BrowserSession>, WatchError> {
        let delay = self.lock().behavior.acquire_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.behavior.fail_acquire {
            return Err(WatchError::SessionAcquisition("mock host refused".to_string()));
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        state.open.insert(
            id.clone(),
            OpenSession {
                task_id: task_id.to_string(),
                callback: None,
            },
        );
        state.open_order.push(id.clone());
        state.acquired += 1;
        state.max_open = state.max_open.max(state.open.len());

        Ok(Box::new(MockSession {
            id,
            task_id: task_id.to_string(),
            state: Arc::clone(&self.state),
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Mock 会话
pub struct MockSession {
    id: String,
    task_id: String,
    state: Arc<Mutex<MockState>>,
}

impl MockSession {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_open(&self, state: &MockState) -> Result<(), WatchError> {
        if state.open.contains_key(&self.id) {
            Ok(())
        } else {
            Err(WatchError::Closed(format!("session {} already closed", self.id)))
        }
    }
}

#[async_trait]
impl BrowserSession for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), WatchError> {
        let mut state = self.lock();
        self.ensure_open(&state).map_err(|e| WatchError::Navigation(e.to_string()))?;
        state.counters(&self.task_id).navigations += 1;
        if state.behavior.fail_navigation || state.failing_urls.iter().any(|u| u == url) {
            return Err(WatchError::Navigation(format!("mock navigation to {} failed", url)));
        }
        Ok(())
    }

    async fn wait_stable(&self, _timeout: Duration) -> bool {
        !self.lock().behavior.never_stable
    }

    async fn reload(&self, _timeout: Duration) -> Result<(), WatchError> {
        let mut state = self.lock();
        self.ensure_open(&state).map_err(|e| WatchError::Navigation(e.to_string()))?;
        state.counters(&self.task_id).reloads += 1;
        Ok(())
    }

    async fn inject_detector(
        &self,
        _params: &DetectorParams,
        on_found: FoundCallback,
    ) -> Result<(), WatchError> {
        let auto_found = {
            let mut state = self.lock();
            self.ensure_open(&state).map_err(|e| WatchError::Injection(e.to_string()))?;
            state.counters(&self.task_id).injections += 1;
            if state.behavior.fail_injection {
                return Err(WatchError::Injection("mock detector rejected".to_string()));
            }
            if let Some(session) = state.open.get_mut(&self.id) {
                session.callback = Some(on_found.clone());
            }
            state.behavior.auto_found.clone()
        };
        if let Some(href) = auto_found {
            on_found.report(href);
        }
        Ok(())
    }

    async fn probe_href(&self, _params: &DetectorParams) -> Option<String> {
        self.lock().page_hrefs.get(&self.task_id).cloned()
    }

    async fn close(&self) {
        let mut state = self.lock();
        if state.open.remove(&self.id).is_some() {
            state.open_order.retain(|sid| sid != &self.id);
            state.closed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_mock_tracks_open_sessions() {
        let provider = MockSessionProvider::new();
        let a = provider.acquire("t1").await.unwrap();
        let b = provider.acquire("t2").await.unwrap();
        assert_eq!(provider.open_sessions(), 2);

        provider.release(a).await;
        b.close().await;
        b.close().await;
        assert_eq!(provider.open_sessions(), 0);
        assert_eq!(provider.max_open(), 2);
        assert_eq!(provider.total_closed(), 2);
    }

    #[tokio::test]
    async fn test_trigger_found_uses_latest_session() {
        let provider = MockSessionProvider::new();
        let old = provider.acquire("t1").await.unwrap();
        let new = provider.acquire("t1").await.unwrap();

        let (old_tx, mut old_rx) = mpsc::channel(1);
        let (new_tx, mut new_rx) = mpsc::channel(1);
        let params = DetectorParams::for_instance(1, "X", None);
        old.inject_detector(&params, FoundCallback::new(1, old_tx)).await.unwrap();
        new.inject_detector(&params, FoundCallback::new(2, new_tx)).await.unwrap();

        assert!(provider.trigger_found("t1", "https://example.com/X"));
        assert!(old_rx.try_recv().is_err());
        assert_eq!(new_rx.try_recv().unwrap().instance, 2);
        assert!(!provider.trigger_found("t2", "https://example.com/X"));
    }

    #[tokio::test]
    async fn test_failing_url_counts_navigation() {
        let provider = MockSessionProvider::new();
        provider.fail_navigation_for("https://down.example");
        let session = provider.acquire("t1").await.unwrap();
        let err = session
            .navigate("https://down.example", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "navigation");
        assert_eq!(provider.navigations("t1"), 1);
    }
}
