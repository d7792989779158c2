//! Headless Chrome 会话提供者
//!
//! 需启用 feature "browser" 且系统已安装 Chrome/Chromium。
//! 浏览器进程懒启动、所有任务共享；每个会话是一个独立 Tab。
//! headless_chrome 是同步 API，所有调用都放进 spawn_blocking。

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;

use super::detector::{detector_script, probe_script};
use super::{BrowserSession, DetectorParams, FoundCallback, SessionProvider};
use crate::core::WatchError;

/// 启动参数
#[derive(Debug, Clone)]
pub struct ChromeOptions {
    pub headless: bool,
    pub executable: Option<PathBuf>,
    pub window_size: (u32, u32),
    pub idle_timeout: Duration,
}

impl Default for ChromeOptions {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            window_size: (1280, 900),
            idle_timeout: Duration::from_secs(3_600),
        }
    }
}

/// Chrome 提供者
pub struct ChromeProvider {
    options: ChromeOptions,
    browser: Arc<Mutex<Option<Browser>>>,
    next_id: AtomicU64,
}

impl ChromeProvider {
    pub fn new(options: ChromeOptions) -> Self {
        Self {
            options,
            browser: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    fn launch(options: &ChromeOptions) -> Result<Browser, String> {
        let launch = LaunchOptions::default_builder()
            .headless(options.headless)
            .path(options.executable.clone())
            .window_size(Some(options.window_size))
            .idle_browser_timeout(options.idle_timeout)
            .build()
            .map_err(|e| format!("Invalid launch options: {}", e))?;
        Browser::new(launch).map_err(|e| format!("Chrome launch failed: {}", e))
    }
}

#[async_trait]
impl SessionProvider for ChromeProvider {
    async fn acquire(&self, task_id: &str) -> Result<Box<dyn BrowserSession>, WatchError> {
        let browser_arc = Arc::clone(&self.browser);
        let options = self.options.clone();

        let tab = tokio::task::spawn_blocking(move || {
            let mut guard = browser_arc.lock().map_err(|e| e.to_string())?;
            if guard.is_none() {
                tracing::info!(headless = options.headless, "Launching Chrome");
                *guard = Some(Self::launch(&options)?);
            }
            let opened = match guard.as_ref() {
                Some(browser) => browser.new_tab().map_err(|e| format!("Browser tab failed: {}", e)),
                None => Err("Chrome not running".to_string()),
            };
            if opened.is_err() {
                // 浏览器进程可能已退出，下次重新启动
                *guard = None;
            }
            opened
        })
        .await
        .map_err(|e| WatchError::SessionAcquisition(format!("Task join: {}", e)))?
        .map_err(WatchError::SessionAcquisition)?;

        let id = format!("tab-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(task_id, session = %id, "Chrome tab opened");
        Ok(Box::new(ChromeSession {
            id,
            tab,
            bindings: Arc::new(Mutex::new(HashSet::new())),
            closed: AtomicBool::new(false),
        }))
    }

    async fn shutdown(&self) {
        let browser_arc = Arc::clone(&self.browser);
        let _ = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = browser_arc.lock() {
                if guard.take().is_some() {
                    tracing::info!("Chrome closed");
                }
            }
        })
        .await;
    }

    fn name(&self) -> &str {
        "chrome"
    }
}

/// 一个 Chrome Tab
pub struct ChromeSession {
    id: String,
    tab: Arc<Tab>,
    /// 已注册的绑定名（同名重复注册跳过）
    bindings: Arc<Mutex<HashSet<String>>>,
    closed: AtomicBool,
}

impl ChromeSession {
    async fn blocking<T, F>(&self, op: F) -> Result<T, String>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Tab>) -> Result<T, String> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(format!("session {} already closed", self.id));
        }
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || op(tab))
            .await
            .map_err(|e| format!("Task join: {}", e))?
    }
}

/// 绑定回调的载荷：页面侧传的是 JSON 编码的字符串
fn decode_payload(payload: Value) -> String {
    match payload {
        Value::String(s) => match serde_json::from_str::<Value>(&s) {
            Ok(Value::String(inner)) => inner,
            _ => s,
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), WatchError> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.set_default_timeout(timeout);
            tab.navigate_to(&url)
                .map_err(|e| format!("Navigate failed: {}", e))?;
            tab.wait_until_navigated()
                .map_err(|e| format!("Navigation did not finish: {}", e))?;
            Ok(())
        })
        .await
        .map_err(WatchError::Navigation)
    }

    async fn wait_stable(&self, timeout: Duration) -> bool {
        let stable = self
            .blocking(move |tab| {
                tab.wait_for_element_with_custom_timeout("body", timeout)
                    .map(|_| ())
                    .map_err(|e| e.to_string())?;
                let state = tab
                    .evaluate("document.readyState", false)
                    .map_err(|e| e.to_string())?;
                Ok(state.value == Some(Value::String("complete".to_string())))
            })
            .await;
        matches!(stable, Ok(true))
    }

    async fn reload(&self, timeout: Duration) -> Result<(), WatchError> {
        self.blocking(move |tab| {
            tab.set_default_timeout(timeout);
            tab.reload(false, None)
                .map_err(|e| format!("Reload failed: {}", e))?;
            tab.wait_until_navigated()
                .map_err(|e| format!("Reload did not finish: {}", e))?;
            Ok(())
        })
        .await
        .map_err(WatchError::Navigation)
    }

    async fn inject_detector(
        &self,
        params: &DetectorParams,
        on_found: FoundCallback,
    ) -> Result<(), WatchError> {
        let binding = params.binding.clone();
        let script = detector_script(params);
        let bindings = Arc::clone(&self.bindings);

        let outcome = self
            .blocking(move |tab| {
                let registered = bindings
                    .lock()
                    .map_err(|e| e.to_string())?
                    .contains(&binding);
                if !registered {
                    let callback = on_found.clone();
                    tab.expose_function(
                        &binding,
                        Arc::new(move |payload: Value| {
                            callback.report(decode_payload(payload));
                        }),
                    )
                    .map_err(|e| format!("Binding registration failed: {}", e))?;
                    bindings
                        .lock()
                        .map_err(|e| e.to_string())?
                        .insert(binding);
                }
                let result = tab
                    .evaluate(&script, false)
                    .map_err(|e| format!("Detector evaluation failed: {}", e))?;
                Ok(result
                    .value
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default())
            })
            .await
            .map_err(WatchError::Injection)?;

        tracing::debug!(session = %self.id, outcome = %outcome, "Detector injected");
        Ok(())
    }

    async fn probe_href(&self, params: &DetectorParams) -> Option<String> {
        let script = probe_script(params);
        self.blocking(move |tab| {
            let result = tab.evaluate(&script, false).map_err(|e| e.to_string())?;
            Ok(result
                .value
                .and_then(|v| v.as_str().map(str::to_string))
                .filter(|s| !s.is_empty()))
        })
        .await
        .ok()
        .flatten()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tab = Arc::clone(&self.tab);
        let id = self.id.clone();
        let _ = tokio::task::spawn_blocking(move || {
            if let Err(e) = tab.close(false) {
                tracing::debug!(session = %id, "Tab close failed: {}", e);
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_payload_unwraps_json_string() {
        assert_eq!(
            decode_payload(Value::String("\"https://example.com/a\"".to_string())),
            "https://example.com/a"
        );
        assert_eq!(
            decode_payload(Value::String("https://example.com/b".to_string())),
            "https://example.com/b"
        );
        assert_eq!(decode_payload(Value::Null), "");
    }
}
