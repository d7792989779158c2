//! 事件广播
//!
//! 任务生命周期事件序列化一次后推送给所有订阅者（SSE 客户端、测试）。
//! 单个订阅者发送失败不影响其他订阅者，也不会把它移出订阅表；订阅者自己退订。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::mpsc;

use super::task::{Task, TaskId};

/// 推送给客户端的事件
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchEvent {
    TaskCreated { task: Task },
    TaskStarted { task: Task },
    TaskFound { task: Task },
    /// 用户提醒（由客户端播放声音 / 弹窗）
    AlarmStarted {
        task_id: TaskId,
        href: String,
        identifier: String,
    },
    TaskStopped { task: Task },
    TaskDeleted { task_id: TaskId },
    TaskResumed { task: Task },
    ReloadCompleted { restarted: usize },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<TaskId>,
        message: String,
    },
}

impl WatchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WatchEvent::TaskCreated { .. } => "task_created",
            WatchEvent::TaskStarted { .. } => "task_started",
            WatchEvent::TaskFound { .. } => "task_found",
            WatchEvent::AlarmStarted { .. } => "alarm_started",
            WatchEvent::TaskStopped { .. } => "task_stopped",
            WatchEvent::TaskDeleted { .. } => "task_deleted",
            WatchEvent::TaskResumed { .. } => "task_resumed",
            WatchEvent::ReloadCompleted { .. } => "reload_completed",
            WatchEvent::Error { .. } => "error",
        }
    }
}

/// 事件信封：序号 + 时间戳
#[derive(Debug, Serialize)]
struct EventEnvelope<'a> {
    seq: u64,
    timestamp: i64,
    #[serde(flatten)]
    event: &'a WatchEvent,
}

type Subscribers = RwLock<HashMap<u64, mpsc::UnboundedSender<String>>>;

/// 广播器（可克隆）
#[derive(Clone, Default)]
pub struct EventBroadcaster {
    subscribers: Arc<Subscribers>,
    next_id: Arc<AtomicU64>,
    seq: Arc<AtomicU64>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新订阅；Subscription drop 时自动退订
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        tracing::debug!(subscriber = id, "Event subscriber added");
        Subscription {
            id,
            rx,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// 序列化一次，推送给全部订阅者；返回成功投递数
    pub fn broadcast(&self, event: &WatchEvent) -> usize {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let envelope = EventEnvelope {
            seq,
            timestamp: chrono::Utc::now().timestamp_millis(),
            event,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(kind = event.kind(), "Failed to serialize event: {}", e);
                serde_json::json!({
                    "seq": seq,
                    "type": "error",
                    "message": format!("failed to serialize {} event", event.kind()),
                })
                .to_string()
            }
        };

        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for (id, tx) in subscribers.iter() {
            match tx.send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => tracing::debug!(subscriber = id, "Event subscriber gone, skipping"),
            }
        }
        tracing::debug!(kind = event.kind(), seq, delivered, "Event broadcast");
        delivered
    }
}

/// 一个订阅：接收序列化后的事件 JSON
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<String>,
    subscribers: Arc<Subscribers>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.rx.try_recv().ok()
    }

    /// 显式退订；重复调用无副作用
    pub fn unsubscribe(&self) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        if removed.is_some() {
            tracing::debug!(subscriber = self.id, "Event subscriber removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskSpec;
    use serde_json::Value;

    #[tokio::test]
    async fn test_broadcast_reaches_every_subscriber() {
        let events = EventBroadcaster::new();
        let mut a = events.subscribe();
        let mut b = events.subscribe();

        let task = Task::new(TaskSpec::new("https://example.com", "X1"));
        assert_eq!(events.broadcast(&WatchEvent::TaskCreated { task: task.clone() }), 2);

        for sub in [&mut a, &mut b] {
            let v: Value = serde_json::from_str(&sub.recv().await.unwrap()).unwrap();
            assert_eq!(v["type"], "task_created");
            assert_eq!(v["task"]["id"], task.id.as_str());
            assert_eq!(v["seq"], 1);
        }
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let events = EventBroadcaster::new();
        let a = events.subscribe();
        let _b = events.subscribe();
        assert_eq!(events.subscriber_count(), 2);

        a.unsubscribe();
        a.unsubscribe();
        assert_eq!(events.subscriber_count(), 1);
        drop(a);
        assert_eq!(events.subscriber_count(), 1);
    }

    #[test]
    fn test_error_event_shape() {
        let events = EventBroadcaster::new();
        let mut sub = events.subscribe();
        events.broadcast(&WatchEvent::Error {
            task_id: None,
            message: "boom".to_string(),
        });
        let v: Value = serde_json::from_str(&sub.try_recv().unwrap()).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["message"], "boom");
        assert!(v.get("task_id").is_none());
    }

    #[test]
    fn test_alarm_event_fields() {
        let event = WatchEvent::AlarmStarted {
            task_id: "task_1".to_string(),
            href: "https://example.com/X1".to_string(),
            identifier: "X1".to_string(),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["type"], "alarm_started");
        assert_eq!(event.kind(), "alarm_started");
        assert_eq!(v["href"], "https://example.com/X1");
    }
}
