//! 任务注册表：内存中的唯一事实来源 + 持久化影子
//!
//! 所有修改都会把完整快照交给 `PersistenceHandle`：普通更新去抖，终态更新立即落盘。
//! 快照在持有写锁时发出，保证写入器收到的顺序与修改顺序一致。

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::error::WatchError;
use super::persistence::PersistenceHandle;
use super::task::{Task, TaskId, TaskSpec};

/// 列表过滤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskFilter {
    #[default]
    All,
    /// starting / running / found
    Active,
}

impl std::str::FromStr for TaskFilter {
    type Err = WatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "all" => Ok(TaskFilter::All),
            "active" => Ok(TaskFilter::Active),
            other => Err(WatchError::Validation(format!("unknown filter: {}", other))),
        }
    }
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Task>,
    /// 插入顺序
    order: Vec<TaskId>,
}

impl Inner {
    fn snapshot(&self) -> Vec<Task> {
        self.order
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }
}

/// 任务注册表
pub struct TaskRegistry {
    inner: RwLock<Inner>,
    persistence: PersistenceHandle,
}

impl TaskRegistry {
    pub fn new(persistence: PersistenceHandle) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            persistence,
        }
    }

    /// 用启动时读取的快照填充（不触发写入）；重复 ID 只保留第一条
    pub fn with_tasks(persistence: PersistenceHandle, tasks: Vec<Task>) -> Self {
        let mut inner = Inner::default();
        for task in tasks {
            if inner.tasks.contains_key(&task.id) {
                tracing::warn!(task_id = %task.id, "Duplicate task id in snapshot, skipping");
                continue;
            }
            inner.order.push(task.id.clone());
            inner.tasks.insert(task.id.clone(), task);
        }
        Self {
            inner: RwLock::new(inner),
            persistence,
        }
    }

    /// 校验并创建任务（状态 starting），安排去抖写入，同步返回 ID
    pub async fn create(&self, spec: TaskSpec) -> Result<Task, WatchError> {
        spec.validate()?;
        let task = Task::new(spec);

        let mut inner = self.inner.write().await;
        inner.order.push(task.id.clone());
        inner.tasks.insert(task.id.clone(), task.clone());
        self.persistence.schedule(inner.snapshot());

        tracing::info!(task_id = %task.id, target = %task.target_url, "Task created");
        Ok(task)
    }

    /// 只读投影（按插入顺序）
    pub async fn list(&self, filter: TaskFilter) -> Vec<Task> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|t| match filter {
                TaskFilter::All => true,
                TaskFilter::Active => t.status.is_active(),
            })
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Task> {
        self.inner.read().await.tasks.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 字段级修改 + 去抖写入
    pub async fn update<F>(&self, id: &str, mutation: F) -> Result<Task, WatchError>
    where
        F: FnOnce(&mut Task),
    {
        let mut inner = self.inner.write().await;
        let task = Self::apply(&mut inner, id, mutation)?;
        self.persistence.schedule(inner.snapshot());
        Ok(task)
    }

    /// 字段级修改 + 立即写入（终态转换用）；写入失败只记日志
    pub async fn update_now<F>(&self, id: &str, mutation: F) -> Result<Task, WatchError>
    where
        F: FnOnce(&mut Task),
    {
        let (task, snapshot) = {
            let mut inner = self.inner.write().await;
            let task = Self::apply(&mut inner, id, mutation)?;
            (task, inner.snapshot())
        };
        self.flush_snapshot(snapshot).await;
        Ok(task)
    }

    /// 删除任务并立即写入；调用方需先停止其监视会话
    pub async fn remove(&self, id: &str) -> Result<Task, WatchError> {
        let (task, snapshot) = {
            let mut inner = self.inner.write().await;
            let task = inner
                .tasks
                .remove(id)
                .ok_or_else(|| WatchError::NotFound(id.to_string()))?;
            inner.order.retain(|tid| tid != id);
            (task, inner.snapshot())
        };
        self.flush_snapshot(snapshot).await;
        tracing::info!(task_id = %id, "Task removed");
        Ok(task)
    }

    /// 强制立即写入当前状态
    pub async fn flush(&self) -> Result<(), WatchError> {
        let snapshot = self.inner.read().await.snapshot();
        self.persistence.flush(snapshot).await
    }

    /// 需要恢复监视的任务（starting / running）
    pub async fn resumable_ids(&self) -> Vec<TaskId> {
        self.list(TaskFilter::All)
            .await
            .into_iter()
            .filter(|t| t.status.is_resumable())
            .map(|t| t.id)
            .collect()
    }

    pub fn persistence(&self) -> &PersistenceHandle {
        &self.persistence
    }

    fn apply<F>(inner: &mut Inner, id: &str, mutation: F) -> Result<Task, WatchError>
    where
        F: FnOnce(&mut Task),
    {
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| WatchError::NotFound(id.to_string()))?;
        mutation(task);
        task.touch();
        Ok(task.clone())
    }

    async fn flush_snapshot(&self, snapshot: Vec<Task>) {
        if let Err(e) = self.persistence.flush(snapshot).await {
            tracing::warn!("Immediate snapshot write failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::persistence::SnapshotStore;
    use crate::core::task::TaskStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry_at(path: &std::path::Path, debounce_ms: u64) -> TaskRegistry {
        TaskRegistry::new(PersistenceHandle::spawn(
            SnapshotStore::new(path),
            Duration::from_millis(debounce_ms),
        ))
    }

    #[tokio::test]
    async fn test_create_and_list_in_insertion_order() {
        let registry = TaskRegistry::new(PersistenceHandle::spawn(
            SnapshotStore::in_memory(),
            Duration::from_millis(10),
        ));
        let a = registry.create(TaskSpec::new("https://a.example", "A")).await.unwrap();
        let b = registry.create(TaskSpec::new("https://b.example", "B")).await.unwrap();
        let c = registry.create(TaskSpec::new("https://c.example", "C")).await.unwrap();

        registry
            .update(&b.id, |t| t.status = TaskStatus::Stopped)
            .await
            .unwrap();

        let all: Vec<_> = registry.list(TaskFilter::All).await.into_iter().map(|t| t.id).collect();
        assert_eq!(all, vec![a.id.clone(), b.id.clone(), c.id.clone()]);

        let active: Vec<_> = registry.list(TaskFilter::Active).await.into_iter().map(|t| t.id).collect();
        assert_eq!(active, vec![a.id, c.id]);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_spec() {
        let registry = TaskRegistry::new(PersistenceHandle::spawn(
            SnapshotStore::in_memory(),
            Duration::from_millis(10),
        ));
        let err = registry.create(TaskSpec::new("https://a.example", " ")).await.unwrap_err();
        assert!(matches!(err, WatchError::Validation(_)));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let registry = TaskRegistry::new(PersistenceHandle::spawn(
            SnapshotStore::in_memory(),
            Duration::from_millis(10),
        ));
        assert!(matches!(
            registry.remove("task_missing").await,
            Err(WatchError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_rapid_updates_coalesce_but_remove_writes_immediately() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        let registry = registry_at(&path, 100);

        let task = registry.create(TaskSpec::new("https://a.example", "A")).await.unwrap();
        for i in 0..20 {
            registry
                .update(&task.id, |t| t.location = Some(format!("row {}", i)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(registry.persistence().stats().writes(), 1);

        let other = registry.create(TaskSpec::new("https://b.example", "B")).await.unwrap();
        registry.remove(&other.id).await.unwrap();
        // remove 不等待静默期
        assert_eq!(registry.persistence().stats().writes(), 2);

        let persisted = SnapshotStore::new(&path).load().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].location.as_deref(), Some("row 19"));
    }

    #[tokio::test]
    async fn test_with_tasks_skips_duplicates_and_reports_resumable() {
        let mut running = Task::new(TaskSpec::new("https://a.example", "A"));
        running.status = TaskStatus::Running;
        let duplicate = running.clone();
        let mut stopped = Task::new(TaskSpec::new("https://b.example", "B"));
        stopped.status = TaskStatus::Stopped;

        let registry = TaskRegistry::with_tasks(
            PersistenceHandle::spawn(SnapshotStore::in_memory(), Duration::from_millis(10)),
            vec![running.clone(), duplicate, stopped],
        );
        assert_eq!(registry.len().await, 2);
        assert_eq!(registry.resumable_ids().await, vec![running.id]);
    }

    #[test]
    fn test_filter_from_str() {
        assert_eq!("active".parse::<TaskFilter>().unwrap(), TaskFilter::Active);
        assert_eq!("".parse::<TaskFilter>().unwrap(), TaskFilter::All);
        assert!("bogus".parse::<TaskFilter>().is_err());
    }
}
