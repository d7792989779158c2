//! 监视会话：一个任务的浏览会话生命周期
//!
//! - 初次附着：准入许可 → 获取会话 → 导航（超时 + 重试）→ 等待稳定（超时继续）→ 注入探测器
//! - 刷新定时器：同一会话内重新导航并重新注入；导航失败降级为原地刷新
//! - 轮换定时器：新会话附着成功后才替换并释放旧会话
//! - 发现闩锁：只写一次；置位后取消全部定时器并通知编排器
//!
//! 每个底层会话带单调递增的实例号，定时器回调先核对实例号再动手，
//! 避免轮换后旧定时器作用到新会话或已释放的会话上。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::admission::{SessionAdmission, SessionPermit};
use super::error::WatchError;
use super::task::Task;
use crate::provider::{BrowserSession, DetectorParams, FoundCallback, FoundReport, SessionProvider};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// 分配新的会话实例号（全局单调递增，0 保留为「无会话」）
fn next_instance() -> u64 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// 监视节奏与超时
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// 刷新周期；为 0 时关闭
    pub reload_interval: Duration,
    /// 轮换周期；为 0 时关闭
    pub rotation_interval: Duration,
    pub navigation_timeout: Duration,
    pub stable_timeout: Duration,
    /// 初次导航失败后的重试次数
    pub navigation_retries: u32,
    /// 轮换等待准入许可的上限，超时则跳过本轮
    pub rotation_admission_timeout: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            reload_interval: Duration::from_secs(3),
            rotation_interval: Duration::from_secs(300),
            navigation_timeout: Duration::from_secs(30),
            stable_timeout: Duration::from_secs(10),
            navigation_retries: 1,
            rotation_admission_timeout: Duration::from_secs(30),
        }
    }
}

/// 会话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchPhase {
    Uninitialized,
    Attaching,
    Watching,
    Found,
    Stopped,
}

/// 发现通知：交给编排器的状态变更路径
#[derive(Debug, Clone)]
pub struct FoundNotice {
    pub task_id: String,
    pub generation: u64,
    pub instance: u64,
    pub href: String,
}

/// 调试视图
#[derive(Debug, Clone, Serialize)]
pub struct WatchSessionInfo {
    pub task_id: String,
    pub generation: u64,
    /// 当前底层会话实例号，0 表示没有
    pub instance: u64,
    pub phase: WatchPhase,
    pub found: bool,
}

/// 已附着的底层会话；未显式 release 就被 drop 时在后台归还
struct Attached {
    instance: u64,
    session: Option<Box<dyn BrowserSession>>,
    permit: Option<SessionPermit>,
    provider: Arc<dyn SessionProvider>,
}

impl Attached {
    fn session(&self) -> Option<&dyn BrowserSession> {
        self.session.as_deref()
    }

    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.provider.release(session).await;
        }
        // 会话关闭后才归还许可
        self.permit.take();
    }
}

impl Drop for Attached {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let permit = self.permit.take();
        let provider = Arc::clone(&self.provider);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                provider.release(session).await;
                drop(permit);
            });
        }
    }
}

/// 一个任务的监视会话
pub struct WatchSession {
    task_id: String,
    generation: u64,
    target_url: String,
    identifier: String,
    container: Option<String>,
    config: WatchConfig,
    provider: Arc<dyn SessionProvider>,
    admission: SessionAdmission,
    current: Mutex<Option<Attached>>,
    /// 当前存活的实例号，0 表示没有
    live: AtomicU64,
    phase: StdMutex<WatchPhase>,
    found: AtomicBool,
    found_href: StdMutex<Option<String>>,
    /// stop() 触发
    cancel: CancellationToken,
    /// 定时器；cancel 的子 token，发现时单独取消
    timers: CancellationToken,
    found_tx: mpsc::Sender<FoundReport>,
    found_rx: StdMutex<Option<mpsc::Receiver<FoundReport>>>,
    notify: mpsc::UnboundedSender<FoundNotice>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

impl WatchSession {
    pub fn new(
        task: &Task,
        generation: u64,
        config: WatchConfig,
        provider: Arc<dyn SessionProvider>,
        admission: SessionAdmission,
        notify: mpsc::UnboundedSender<FoundNotice>,
    ) -> Arc<Self> {
        let (found_tx, found_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let timers = cancel.child_token();
        Arc::new(Self {
            task_id: task.id.clone(),
            generation,
            target_url: task.target_url.clone(),
            identifier: task.identifier.clone(),
            container: task.container.clone(),
            config,
            provider,
            admission,
            current: Mutex::new(None),
            live: AtomicU64::new(0),
            phase: StdMutex::new(WatchPhase::Uninitialized),
            found: AtomicBool::new(false),
            found_href: StdMutex::new(None),
            cancel,
            timers,
            found_tx,
            found_rx: StdMutex::new(Some(found_rx)),
            notify,
            handles: StdMutex::new(Vec::new()),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> WatchPhase {
        *lock(&self.phase)
    }

    pub fn is_found(&self) -> bool {
        self.found.load(Ordering::SeqCst)
    }

    pub fn found_href(&self) -> Option<String> {
        lock(&self.found_href).clone()
    }

    /// 当前存活的底层会话实例号
    pub fn instance(&self) -> Option<u64> {
        match self.live.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }

    pub fn info(&self) -> WatchSessionInfo {
        WatchSessionInfo {
            task_id: self.task_id.clone(),
            generation: self.generation,
            instance: self.live.load(Ordering::SeqCst),
            phase: self.phase(),
            found: self.is_found(),
        }
    }

    /// 附着底层会话并启动定时器
    ///
    /// 失败时已获取的会话会被释放，阶段回到 Uninitialized，可再次 start()。
    pub async fn start(self: &Arc<Self>) -> Result<(), WatchError> {
        {
            let mut phase = lock(&self.phase);
            match *phase {
                WatchPhase::Uninitialized => *phase = WatchPhase::Attaching,
                WatchPhase::Stopped | WatchPhase::Found => {
                    return Err(WatchError::Closed(format!("watch for {} already finished", self.task_id)))
                }
                WatchPhase::Attaching | WatchPhase::Watching => {
                    return Err(WatchError::Closed(format!("watch for {} already started", self.task_id)))
                }
            }
        }

        if let Some(rx) = lock(&self.found_rx).take() {
            let listener = tokio::spawn(Arc::clone(self).found_listener(rx));
            lock(&self.handles).push(listener);
        }

        let attached = tokio::select! {
            _ = self.cancel.cancelled() => Err(WatchError::Cancelled),
            result = self.attach() => result,
        };

        let attached = match attached {
            Ok(a) => a,
            Err(e) => {
                let mut phase = lock(&self.phase);
                if *phase == WatchPhase::Attaching {
                    *phase = WatchPhase::Uninitialized;
                }
                return Err(e);
            }
        };

        {
            let mut current = self.current.lock().await;
            if self.cancel.is_cancelled() {
                drop(current);
                attached.release().await;
                return Err(WatchError::Cancelled);
            }
            self.live.store(attached.instance, Ordering::SeqCst);
            tracing::info!(task_id = %self.task_id, instance = attached.instance, "Watch session attached");
            *current = Some(attached);
        }

        {
            let mut phase = lock(&self.phase);
            if *phase == WatchPhase::Attaching {
                *phase = WatchPhase::Watching;
            }
        }

        self.spawn_timers();
        Ok(())
    }

    /// 取消定时器、释放底层会话、清空发现状态；可重复调用
    pub async fn stop(&self) {
        self.cancel.cancel();

        let handles = std::mem::take(&mut *lock(&self.handles));
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }

        let attached = self.current.lock().await.take();
        self.live.store(0, Ordering::SeqCst);
        if let Some(attached) = attached {
            let instance = attached.instance;
            attached.release().await;
            tracing::info!(task_id = %self.task_id, instance, "Watch session released");
        }

        self.found.store(false, Ordering::SeqCst);
        *lock(&self.found_href) = None;
        *lock(&self.phase) = WatchPhase::Stopped;
    }

    /// 尽力从当前页面取回目标链接
    pub async fn probe_href(&self) -> Option<String> {
        let current = self.current.lock().await;
        let attached = current.as_ref()?;
        let params = self.detector_params(attached.instance);
        attached.session()?.probe_href(&params).await
    }

    fn spawn_timers(self: &Arc<Self>) {
        if self.timers.is_cancelled() {
            return;
        }
        let mut handles = lock(&self.handles);
        if !self.config.reload_interval.is_zero() {
            handles.push(tokio::spawn(Arc::clone(self).reload_loop()));
        }
        if !self.config.rotation_interval.is_zero() {
            handles.push(tokio::spawn(Arc::clone(self).rotation_loop()));
        }
    }

    async fn attach(&self) -> Result<Attached, WatchError> {
        let permit = self.admission.acquire().await?;
        self.attach_with(permit).await
    }

    async fn attach_with(&self, permit: SessionPermit) -> Result<Attached, WatchError> {
        let instance = next_instance();
        let session = self.provider.acquire(&self.task_id).await?;
        let attached = Attached {
            instance,
            session: Some(session),
            permit: Some(permit),
            provider: Arc::clone(&self.provider),
        };

        let prepared = match attached.session() {
            Some(session) => self.prepare(session, instance).await,
            None => Err(WatchError::SessionAcquisition("session missing".to_string())),
        };
        match prepared {
            Ok(()) => Ok(attached),
            Err(e) => {
                attached.release().await;
                Err(e)
            }
        }
    }

    /// 导航（带重试）→ 等待稳定 → 注入探测器
    async fn prepare(&self, session: &dyn BrowserSession, instance: u64) -> Result<(), WatchError> {
        let attempts = self.config.navigation_retries + 1;
        let mut last_err = None;
        for attempt in 1..=attempts {
            if self.timers.is_cancelled() {
                return Err(WatchError::Cancelled);
            }
            match self.navigate(session).await {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %self.task_id,
                        instance,
                        attempt,
                        "Navigation failed: {}",
                        e
                    );
                    last_err = Some(e);
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }

        if !session.wait_stable(self.config.stable_timeout).await {
            tracing::debug!(task_id = %self.task_id, instance, "Page not stable before timeout, injecting anyway");
        }
        if self.timers.is_cancelled() {
            return Err(WatchError::Cancelled);
        }

        let params = self.detector_params(instance);
        session
            .inject_detector(&params, FoundCallback::new(instance, self.found_tx.clone()))
            .await
    }

    async fn navigate(&self, session: &dyn BrowserSession) -> Result<(), WatchError> {
        let timeout = self.config.navigation_timeout;
        match tokio::time::timeout(timeout, session.navigate(&self.target_url, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(WatchError::Navigation(format!(
                "{} timed out after {:?}",
                self.target_url, timeout
            ))),
        }
    }

    fn detector_params(&self, instance: u64) -> DetectorParams {
        DetectorParams::for_instance(instance, &self.identifier, self.container.as_deref())
    }

    async fn reload_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.reload_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.timers.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.is_found() {
                break;
            }
            let expected = self.live.load(Ordering::SeqCst);
            if expected == 0 {
                continue;
            }
            let result = tokio::select! {
                _ = self.timers.cancelled() => break,
                r = self.reload_once(expected) => r,
            };
            if let Err(e) = result {
                if !e.is_recoverable() {
                    tracing::debug!(task_id = %self.task_id, "Reload timer stopping: {}", e);
                    break;
                }
                tracing::warn!(task_id = %self.task_id, instance = expected, "Reload failed, retrying next cycle: {}", e);
            }
        }
    }

    /// 同一会话内重新导航并重新注入；导航失败时原地刷新
    async fn reload_once(&self, expected: u64) -> Result<(), WatchError> {
        let current = self.current.lock().await;
        let Some(attached) = current.as_ref() else {
            return Ok(());
        };
        if attached.instance != expected || self.is_found() {
            tracing::debug!(task_id = %self.task_id, expected, "Skipping reload for stale instance");
            return Ok(());
        }
        let Some(session) = attached.session() else {
            return Ok(());
        };

        if let Err(e) = self.navigate(session).await {
            tracing::debug!(task_id = %self.task_id, instance = expected, "Reload navigation failed ({}), reloading in place", e);
            session.reload(self.config.navigation_timeout).await?;
        }

        if !session.wait_stable(self.config.stable_timeout).await {
            tracing::debug!(task_id = %self.task_id, instance = expected, "Page not stable after reload");
        }

        let params = self.detector_params(expected);
        session
            .inject_detector(&params, FoundCallback::new(expected, self.found_tx.clone()))
            .await
    }

    async fn rotation_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.rotation_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.timers.cancelled() => break,
                _ = interval.tick() => {}
            }
            if self.is_found() {
                break;
            }
            let result = tokio::select! {
                _ = self.timers.cancelled() => break,
                r = self.rotate_once() => r,
            };
            if let Err(e) = result {
                if !e.is_recoverable() {
                    tracing::debug!(task_id = %self.task_id, "Rotation timer stopping: {}", e);
                    break;
                }
                tracing::warn!(task_id = %self.task_id, "Rotation failed, retrying next cycle: {}", e);
            }
        }
    }

    /// 附着一个全新的底层会话，确认成功后替换并释放旧会话；没有空位时跳过本轮
    async fn rotate_once(&self) -> Result<(), WatchError> {
        let expected = self.live.load(Ordering::SeqCst);
        if expected == 0 {
            return Ok(());
        }

        let permit = match tokio::time::timeout(
            self.config.rotation_admission_timeout,
            self.admission.acquire(),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::debug!(task_id = %self.task_id, "Rotation skipped: no session capacity");
                return Ok(());
            }
        };

        let fresh = self.attach_with(permit).await?;

        let old = {
            let mut current = self.current.lock().await;
            let still_live = current.as_ref().map(|a| a.instance) == Some(expected)
                && !self.timers.is_cancelled()
                && !self.is_found();
            if !still_live {
                drop(current);
                fresh.release().await;
                return Ok(());
            }
            let instance = fresh.instance;
            self.live.store(instance, Ordering::SeqCst);
            tracing::info!(task_id = %self.task_id, from = expected, to = instance, "Watch session rotated");
            current.replace(fresh)
        };

        if let Some(old) = old {
            old.release().await;
        }
        Ok(())
    }

    async fn found_listener(self: Arc<Self>, mut rx: mpsc::Receiver<FoundReport>) {
        loop {
            let report = tokio::select! {
                _ = self.cancel.cancelled() => break,
                report = rx.recv() => match report {
                    Some(r) => r,
                    None => break,
                },
            };

            if !self.latch(&report.href) {
                continue;
            }
            self.timers.cancel();
            tracing::info!(
                task_id = %self.task_id,
                instance = report.instance,
                href = %report.href,
                "Target link found"
            );
            let _ = self.notify.send(FoundNotice {
                task_id: self.task_id.clone(),
                generation: self.generation,
                instance: report.instance,
                href: report.href,
            });
            break;
        }
    }

    /// 置位发现闩锁；已置位时返回 false
    fn latch(&self, href: &str) -> bool {
        if self
            .found
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        *lock(&self.found_href) = Some(href.to_string());
        let mut phase = lock(&self.phase);
        if *phase != WatchPhase::Stopped {
            *phase = WatchPhase::Found;
        }
        true
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskSpec;
    use crate::provider::{MockBehavior, MockSessionProvider};

    fn fast_config() -> WatchConfig {
        WatchConfig {
            reload_interval: Duration::from_millis(30),
            rotation_interval: Duration::ZERO,
            navigation_timeout: Duration::from_millis(200),
            stable_timeout: Duration::from_millis(50),
            navigation_retries: 1,
            rotation_admission_timeout: Duration::from_millis(100),
        }
    }

    fn session_for(
        provider: &MockSessionProvider,
        config: WatchConfig,
        admission: SessionAdmission,
    ) -> (Arc<WatchSession>, Task, mpsc::UnboundedReceiver<FoundNotice>) {
        let task = Task::new(TaskSpec::new("https://example.com/shows", "X123"));
        let (tx, rx) = mpsc::unbounded_channel();
        let session = WatchSession::new(
            &task,
            1,
            config,
            Arc::new(provider.clone()),
            admission,
            tx,
        );
        (session, task, rx)
    }

    #[tokio::test]
    async fn test_start_attaches_and_injects() {
        let provider = MockSessionProvider::new();
        let (session, task, _rx) = session_for(&provider, fast_config(), SessionAdmission::new(2));

        session.start().await.unwrap();
        assert_eq!(session.phase(), WatchPhase::Watching);
        assert!(session.instance().is_some());
        assert_eq!(provider.open_sessions_for(&task.id), 1);
        assert_eq!(provider.injections(&task.id), 1);

        session.stop().await;
        assert_eq!(provider.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_navigation_failure_is_retried_then_reported() {
        let provider = MockSessionProvider::new();
        provider.fail_navigation_for("https://example.com/shows");
        let admission = SessionAdmission::new(1);
        let (session, task, _rx) = session_for(&provider, fast_config(), admission.clone());

        let err = session.start().await.unwrap_err();
        assert!(matches!(err, WatchError::Navigation(_)));
        assert_eq!(provider.navigations(&task.id), 2);
        assert_eq!(session.phase(), WatchPhase::Uninitialized);
        assert_eq!(provider.open_sessions(), 0);
        assert_eq!(admission.in_use(), 0);
    }

    #[tokio::test]
    async fn test_acquisition_failure_leaves_session_recoverable() {
        let provider = MockSessionProvider::with_behavior(MockBehavior {
            fail_acquire: true,
            ..Default::default()
        });
        let (session, _task, _rx) = session_for(&provider, fast_config(), SessionAdmission::new(1));

        assert!(matches!(
            session.start().await,
            Err(WatchError::SessionAcquisition(_))
        ));
        provider.set_behavior(MockBehavior::default());
        session.start().await.unwrap();
        assert_eq!(session.phase(), WatchPhase::Watching);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_unstable_page_still_injects() {
        let provider = MockSessionProvider::with_behavior(MockBehavior {
            never_stable: true,
            ..Default::default()
        });
        let (session, task, _rx) = session_for(&provider, fast_config(), SessionAdmission::new(1));
        session.start().await.unwrap();
        assert_eq!(provider.injections(&task.id), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_reload_timer_renavigates_same_session() {
        let provider = MockSessionProvider::new();
        let (session, task, _rx) = session_for(&provider, fast_config(), SessionAdmission::new(1));
        session.start().await.unwrap();
        let instance = session.instance();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(provider.navigations(&task.id) >= 3);
        assert!(provider.injections(&task.id) >= 3);
        assert_eq!(session.instance(), instance);
        assert_eq!(provider.total_acquired(), 1);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_reload_falls_back_to_in_place_refresh() {
        let provider = MockSessionProvider::new();
        let (session, task, _rx) = session_for(&provider, fast_config(), SessionAdmission::new(1));
        session.start().await.unwrap();
        let instance = session.instance();
        assert_eq!(provider.reloads(&task.id), 0);

        provider.set_behavior(MockBehavior {
            fail_navigation: true,
            ..Default::default()
        });
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(provider.reloads(&task.id) > 0);
        assert!(provider.injections(&task.id) >= 2);
        assert_eq!(session.phase(), WatchPhase::Watching);
        assert_eq!(session.instance(), instance);
        assert_eq!(provider.open_sessions_for(&task.id), 1);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_found_latches_once_and_stops_timers() {
        let provider = MockSessionProvider::new();
        let (session, task, mut rx) = session_for(&provider, fast_config(), SessionAdmission::new(1));
        session.start().await.unwrap();

        assert!(provider.trigger_found(&task.id, "https://example.com/X123"));
        assert!(provider.trigger_found(&task.id, "https://example.com/other"));

        let notice = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.href, "https://example.com/X123");
        assert!(session.is_found());
        assert_eq!(session.phase(), WatchPhase::Found);
        assert_eq!(session.found_href().as_deref(), Some("https://example.com/X123"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let activity = provider.activity(&task.id);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(provider.activity(&task.id), activity);
        assert!(rx.try_recv().is_err());

        session.stop().await;
        assert!(!session.is_found());
        assert!(session.found_href().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_silences_timers() {
        let provider = MockSessionProvider::new();
        let (session, task, _rx) = session_for(&provider, fast_config(), SessionAdmission::new(1));
        session.start().await.unwrap();

        session.stop().await;
        session.stop().await;
        let activity = provider.activity(&task.id);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(provider.activity(&task.id), activity);
        assert_eq!(session.phase(), WatchPhase::Stopped);
        assert!(session.start().await.is_err());
    }

    #[tokio::test]
    async fn test_rotation_swaps_after_new_session_attached() {
        let provider = MockSessionProvider::new();
        let config = WatchConfig {
            reload_interval: Duration::ZERO,
            rotation_interval: Duration::from_millis(40),
            ..fast_config()
        };
        let (session, task, _rx) = session_for(&provider, config, SessionAdmission::new(2));
        session.start().await.unwrap();
        let first = session.instance().unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        let later = session.instance().unwrap();
        assert!(later > first);
        assert!(provider.total_acquired() >= 2);
        assert_eq!(provider.open_sessions_for(&task.id), 1);
        assert!(provider.max_open() <= 2);

        session.stop().await;
        assert_eq!(provider.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_rotation_waits_for_capacity() {
        let provider = MockSessionProvider::new();
        let config = WatchConfig {
            reload_interval: Duration::ZERO,
            rotation_interval: Duration::from_millis(30),
            ..fast_config()
        };
        // 上限 1：轮换拿不到第二个许可，只能跳过
        let (session, _task, _rx) = session_for(&provider, config, SessionAdmission::new(1));
        session.start().await.unwrap();
        let first = session.instance();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(session.instance(), first);
        assert_eq!(provider.max_open(), 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_stop_during_admission_wait_cancels_start() {
        let provider = MockSessionProvider::new();
        let admission = SessionAdmission::new(1);
        let _held = admission.acquire().await.unwrap();
        let (session, _task, _rx) = session_for(&provider, fast_config(), admission);

        let starter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.start().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        session.stop().await;

        let result = starter.await.unwrap();
        assert!(matches!(result, Err(WatchError::Cancelled)));
        assert_eq!(provider.total_acquired(), 0);
    }
}
