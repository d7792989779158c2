//! 任务快照持久化
//!
//! - `SnapshotStore`：单文件 JSON，写临时文件后 rename，崩溃时不会留下半截快照
//! - `PersistenceHandle`：后台写入器，普通更新去抖合并（静默期后写一次），
//!   终态更新（stop / delete / found / error）立即写入并等待确认
//!
//! 去抖写入在崩溃时可能丢失最后一次非终态更新；内存状态始终是唯一事实来源。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::error::WatchError;
use super::task::Task;

/// 快照文件存储；path 为 None 时仅内存运行
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: Option<PathBuf>,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
        }
    }

    pub fn in_memory() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 读取快照；文件不存在时返回空 Vec
    pub async fn load(&self) -> Result<Vec<Task>, WatchError> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let data = match fs::read(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if data.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    /// 原子写入：先写 `<file>.tmp` 并 fsync，再 rename 覆盖
    pub async fn save(&self, tasks: &[Task]) -> Result<(), WatchError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_vec_pretty(tasks)?;
        let tmp = tmp_path(path);

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// 把读不出的快照改名为 `<file>.corrupt`，避免被下一次写入覆盖
    pub async fn quarantine(&self) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        let target = sibling(path, ".corrupt");
        match fs::rename(path, &target).await {
            Ok(()) => Some(target),
            Err(e) => {
                tracing::warn!("Could not move corrupt snapshot aside: {}", e);
                None
            }
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "tasks.json".into());
    name.push(suffix);
    path.with_file_name(name)
}

/// 写入统计（调试视图 / 测试用）
#[derive(Debug, Default)]
pub struct PersistStats {
    writes: AtomicU64,
    failures: AtomicU64,
}

impl PersistStats {
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

enum PersistRequest {
    /// 去抖写入
    Schedule(Vec<Task>),
    /// 立即写入，完成后回执
    Flush(Vec<Task>, oneshot::Sender<Result<(), WatchError>>),
}

/// 后台写入器句柄
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistRequest>,
    stats: Arc<PersistStats>,
}

impl PersistenceHandle {
    /// 启动写入器；debounce 为静默期，持续抖动时最长延迟 4 倍静默期
    pub fn spawn(store: SnapshotStore, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(PersistStats::default());
        tokio::spawn(run_writer(store, debounce, rx, Arc::clone(&stats)));
        Self { tx, stats }
    }

    /// 安排一次去抖写入（同一静默期内的多次更新合并为一次）
    pub fn schedule(&self, tasks: Vec<Task>) {
        if self.tx.send(PersistRequest::Schedule(tasks)).is_err() {
            tracing::warn!("Persistence writer stopped, dropping scheduled snapshot");
        }
    }

    /// 立即写入并等待结果，同时取消尚未落盘的去抖写入
    pub async fn flush(&self, tasks: Vec<Task>) -> Result<(), WatchError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(PersistRequest::Flush(tasks, ack_tx))
            .map_err(|_| WatchError::Closed("persistence writer".to_string()))?;
        ack_rx
            .await
            .map_err(|_| WatchError::Closed("persistence writer".to_string()))?
    }

    pub fn stats(&self) -> &PersistStats {
        &self.stats
    }
}

async fn run_writer(
    store: SnapshotStore,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<PersistRequest>,
    stats: Arc<PersistStats>,
) {
    let max_wait = debounce * 4;
    let mut pending: Option<Vec<Task>> = None;
    let mut first_pending_at: Option<Instant> = None;
    let mut deadline: Option<Instant> = None;

    loop {
        let current_deadline = deadline;
        let quiet = async move {
            match current_deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            req = rx.recv() => match req {
                Some(PersistRequest::Schedule(tasks)) => {
                    let now = Instant::now();
                    let first = *first_pending_at.get_or_insert(now);
                    pending = Some(tasks);
                    deadline = Some((now + debounce).min(first + max_wait));
                }
                Some(PersistRequest::Flush(tasks, ack)) => {
                    pending = None;
                    first_pending_at = None;
                    deadline = None;
                    let result = write_snapshot(&store, &tasks, &stats).await;
                    let _ = ack.send(result);
                }
                None => {
                    if let Some(tasks) = pending.take() {
                        let _ = write_snapshot(&store, &tasks, &stats).await;
                    }
                    break;
                }
            },
            _ = quiet => {
                deadline = None;
                first_pending_at = None;
                if let Some(tasks) = pending.take() {
                    let _ = write_snapshot(&store, &tasks, &stats).await;
                }
            }
        }
    }

    tracing::debug!("Persistence writer finished");
}

async fn write_snapshot(
    store: &SnapshotStore,
    tasks: &[Task],
    stats: &PersistStats,
) -> Result<(), WatchError> {
    stats.writes.fetch_add(1, Ordering::SeqCst);
    match store.save(tasks).await {
        Ok(()) => {
            tracing::debug!(tasks = tasks.len(), "Snapshot written");
            Ok(())
        }
        Err(e) => {
            stats.failures.fetch_add(1, Ordering::SeqCst);
            tracing::warn!("Snapshot write failed: {}", e);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskSpec;
    use tempfile::TempDir;

    fn sample(n: usize) -> Vec<Task> {
        (0..n)
            .map(|i| Task::new(TaskSpec::new("https://example.com", format!("ID{}", i))))
            .collect()
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path().join("nope.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_is_atomic_and_preserves_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("tasks.json");
        let store = SnapshotStore::new(&path);

        let tasks = sample(3);
        store.save(&tasks).await.unwrap();

        assert!(!dir.path().join("state").join("tasks.json.tmp").exists());
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, tasks);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_persistence_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        fs::write(&path, "{ not json").await.unwrap();
        let err = SnapshotStore::new(&path).load().await.unwrap_err();
        assert_eq!(err.kind(), "persistence");
    }

    #[tokio::test]
    async fn test_debounce_coalesces_burst() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        let handle = PersistenceHandle::spawn(SnapshotStore::new(&path), Duration::from_millis(50));

        for i in 1..=10 {
            handle.schedule(sample(i));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(handle.stats().writes(), 1);
        let loaded = SnapshotStore::new(&path).load().await.unwrap();
        assert_eq!(loaded.len(), 10);
    }

    #[tokio::test]
    async fn test_flush_writes_immediately_and_cancels_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tasks.json");
        let handle = PersistenceHandle::spawn(SnapshotStore::new(&path), Duration::from_secs(60));

        handle.schedule(sample(1));
        handle.flush(sample(2)).await.unwrap();
        assert_eq!(handle.stats().writes(), 1);
        assert_eq!(SnapshotStore::new(&path).load().await.unwrap().len(), 2);
    }
}
