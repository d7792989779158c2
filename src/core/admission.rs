//! 会话准入控制：全局并发上限
//!
//! 打开任何底层浏览会话（初次附着或轮换）前必须先取得许可；许可随会话一起持有，
//! 会话关闭时释放。超出上限的请求排队等待而不是失败。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::error::WatchError;

#[derive(Debug, Default)]
struct Usage {
    in_use: AtomicUsize,
    high_water: AtomicUsize,
}

/// 准入控制器（可克隆，共享同一个信号量）
#[derive(Clone, Debug)]
pub struct SessionAdmission {
    semaphore: Arc<Semaphore>,
    ceiling: usize,
    usage: Arc<Usage>,
}

/// 会话许可：drop 时归还
#[derive(Debug)]
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
    usage: Arc<Usage>,
}

impl Drop for SessionPermit {
    fn drop(&mut self) {
        self.usage.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SessionAdmission {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        let ceiling = max_concurrent_sessions.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            ceiling,
            usage: Arc::new(Usage::default()),
        }
    }

    /// 等待许可；信号量关闭（关停中）时返回 Closed
    pub async fn acquire(&self) -> Result<SessionPermit, WatchError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WatchError::Closed("session admission".to_string()))?;
        Ok(self.track(permit))
    }

    /// 关停：拒绝后续所有许可请求，唤醒正在等待者
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn in_use(&self) -> usize {
        self.usage.in_use.load(Ordering::SeqCst)
    }

    /// 历史最高同时占用数
    pub fn high_water(&self) -> usize {
        self.usage.high_water.load(Ordering::SeqCst)
    }

    fn track(&self, permit: OwnedSemaphorePermit) -> SessionPermit {
        let now = self.usage.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        self.usage.high_water.fetch_max(now, Ordering::SeqCst);
        SessionPermit {
            _permit: permit,
            usage: Arc::clone(&self.usage),
        }
    }
}

impl Default for SessionAdmission {
    fn default() -> Self {
        Self::new(6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ceiling_blocks_until_release() {
        let admission = SessionAdmission::new(2);
        let a = admission.acquire().await.unwrap();
        let _b = admission.acquire().await.unwrap();
        assert_eq!(admission.in_use(), 2);
        assert!(tokio::time::timeout(Duration::from_millis(20), admission.acquire())
            .await
            .is_err());

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(a);
        waiter.await.unwrap().unwrap();
        assert_eq!(admission.high_water(), 2);
    }

    #[tokio::test]
    async fn test_close_rejects_waiters() {
        let admission = SessionAdmission::new(1);
        let _held = admission.acquire().await.unwrap();
        admission.close();
        assert!(matches!(admission.acquire().await, Err(WatchError::Closed(_))));
    }

    #[test]
    fn test_zero_ceiling_is_clamped() {
        assert_eq!(SessionAdmission::new(0).ceiling(), 1);
    }
}
