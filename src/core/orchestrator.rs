//! 编排器：主控循环
//!
//! 单个后台任务按顺序处理客户端命令（create/stop/delete/reload/snapshot/shutdown）
//! 与内部通知（启动结果、发现通知、错峰重启），任务状态只在这里被修改。
//! 会话启动、错峰等待、自动化动作等耗时操作放到独立任务里，完成后回报。
//!
//! 每次启动监视会话都分配新的 generation；来自旧 generation 的通知一律忽略。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::admission::SessionAdmission;
use super::error::WatchError;
use super::events::{EventBroadcaster, Subscription, WatchEvent};
use super::persistence::{PersistenceHandle, SnapshotStore};
use super::registry::{TaskFilter, TaskRegistry};
use super::state::{AdmissionUsage, OrchestratorSnapshot, PersistenceUsage};
use super::task::{Task, TaskId, TaskSpec, TaskStatus};
use super::watch_session::{FoundNotice, WatchConfig, WatchSession};
use crate::automation::Automation;
use crate::provider::SessionProvider;

/// 编排器参数
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub watch: WatchConfig,
    /// 同时打开的底层会话上限
    pub max_concurrent_sessions: usize,
    /// 全局 reload：停止全部会话后的暂停
    pub reload_pause: Duration,
    /// 批量重启的错峰间隔
    pub restart_stagger: Duration,
    /// 普通更新的落盘去抖
    pub persist_debounce: Duration,
    /// 启动时恢复 starting / running 任务
    pub resume_on_start: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            watch: WatchConfig::default(),
            max_concurrent_sessions: 6,
            reload_pause: Duration::from_secs(1),
            restart_stagger: Duration::from_millis(500),
            persist_debounce: Duration::from_millis(250),
            resume_on_start: true,
        }
    }
}

/// 客户端命令
enum Command {
    Create {
        spec: TaskSpec,
        reply: oneshot::Sender<Result<Task, WatchError>>,
    },
    Stop {
        id: TaskId,
        reply: oneshot::Sender<Result<Task, WatchError>>,
    },
    Delete {
        id: TaskId,
        reply: oneshot::Sender<Result<(), WatchError>>,
    },
    Reload {
        id: TaskId,
        reply: oneshot::Sender<Result<usize, WatchError>>,
    },
    Snapshot {
        reply: oneshot::Sender<OrchestratorSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// 后台任务回报
enum Internal {
    Started {
        task_id: TaskId,
        generation: u64,
        resumed: bool,
        result: Result<(), WatchError>,
    },
    /// 错峰重启的某一项到点
    Launch {
        task_id: TaskId,
        epoch: u64,
        resumed: bool,
    },
    ReloadFinished {
        epoch: u64,
        restarted: usize,
    },
}

struct ActiveWatch {
    generation: u64,
    session: Arc<WatchSession>,
}

/// 编排器句柄（可克隆）
#[derive(Clone)]
pub struct Orchestrator {
    cmd_tx: mpsc::UnboundedSender<Command>,
    registry: Arc<TaskRegistry>,
    events: EventBroadcaster,
}

impl Orchestrator {
    /// 读取快照、启动主控循环，并按配置恢复未完成的任务
    pub async fn init(
        config: OrchestratorConfig,
        store: SnapshotStore,
        provider: Arc<dyn SessionProvider>,
        automation: Arc<dyn Automation>,
    ) -> Result<Self, WatchError> {
        let tasks = match store.load().await {
            Ok(tasks) => tasks,
            Err(e) => {
                let moved = store.quarantine().await;
                tracing::error!(
                    moved_to = ?moved,
                    "Task snapshot unreadable, starting empty: {}",
                    e
                );
                Vec::new()
            }
        };
        let store_path = store.path().map(|p| p.display().to_string());
        tracing::info!(
            tasks = tasks.len(),
            path = store_path.as_deref().unwrap_or("<memory>"),
            "Task snapshot loaded"
        );

        let persistence = PersistenceHandle::spawn(store, config.persist_debounce);
        let registry = Arc::new(TaskRegistry::with_tasks(persistence, tasks));
        let events = EventBroadcaster::new();
        let admission = SessionAdmission::new(config.max_concurrent_sessions);

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (found_tx, found_rx) = mpsc::unbounded_channel();

        let resume = config.resume_on_start;
        let mut actor = Actor {
            config,
            registry: Arc::clone(&registry),
            events: events.clone(),
            provider,
            automation,
            admission,
            store_path,
            active: HashMap::new(),
            next_generation: 1,
            reload_epoch: 0,
            background: CancellationToken::new(),
            internal_tx,
            found_tx,
        };

        if resume {
            actor.resume_all().await;
        }
        tokio::spawn(actor.run(cmd_rx, internal_rx, found_rx));

        Ok(Self {
            cmd_tx,
            registry,
            events,
        })
    }

    /// 创建任务并开始监视；返回处于 starting 的任务
    pub async fn create_task(&self, spec: TaskSpec) -> Result<Task, WatchError> {
        self.request(|reply| Command::Create { spec, reply }).await?
    }

    pub async fn list_tasks(&self, filter: TaskFilter) -> Vec<Task> {
        self.registry.list(filter).await
    }

    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.registry.get(id).await
    }

    pub async fn stop_task(&self, id: &str) -> Result<Task, WatchError> {
        let id = id.to_string();
        self.request(|reply| Command::Stop { id, reply }).await?
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), WatchError> {
        let id = id.to_string();
        self.request(|reply| Command::Delete { id, reply }).await?
    }

    /// 全局 reload（id 只用于校验存在）；返回排队重启的任务数
    pub async fn reload_task(&self, id: &str) -> Result<usize, WatchError> {
        let id = id.to_string();
        self.request(|reply| Command::Reload { id, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<OrchestratorSnapshot, WatchError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// 停止全部会话（任务状态保持不变，下次启动时恢复）、落盘、关闭会话宿主
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            tracing::debug!("Orchestrator already stopped");
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, WatchError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| WatchError::Closed("orchestrator".to_string()))?;
        rx.await
            .map_err(|_| WatchError::Closed("orchestrator".to_string()))
    }
}

struct Actor {
    config: OrchestratorConfig,
    registry: Arc<TaskRegistry>,
    events: EventBroadcaster,
    provider: Arc<dyn SessionProvider>,
    automation: Arc<dyn Automation>,
    admission: SessionAdmission,
    store_path: Option<String>,
    active: HashMap<TaskId, ActiveWatch>,
    next_generation: u64,
    reload_epoch: u64,
    /// 错峰 / 暂停等后台任务，关停时取消
    background: CancellationToken,
    internal_tx: mpsc::UnboundedSender<Internal>,
    found_tx: mpsc::UnboundedSender<FoundNotice>,
}

impl Actor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
        mut found_rx: mpsc::UnboundedReceiver<FoundNotice>,
    ) {
        tracing::info!(provider = self.provider.name(), "Orchestrator loop started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(notice) = found_rx.recv() => self.on_found(notice).await,
                Some(msg) = internal_rx.recv() => self.handle_internal(msg).await,
            }
        }
        tracing::info!("Orchestrator loop stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Create { spec, reply } => {
                let _ = reply.send(self.create(spec).await);
            }
            Command::Stop { id, reply } => {
                let _ = reply.send(self.stop(&id).await);
            }
            Command::Delete { id, reply } => {
                let _ = reply.send(self.delete(&id).await);
            }
            Command::Reload { id, reply } => {
                let _ = reply.send(self.reload(&id).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot().await);
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::Started {
                task_id,
                generation,
                resumed,
                result,
            } => self.on_started(task_id, generation, resumed, result).await,
            Internal::Launch {
                task_id,
                epoch,
                resumed,
            } => {
                if epoch != self.reload_epoch {
                    tracing::debug!(task_id = %task_id, epoch, "Dropping launch from superseded reload");
                    return;
                }
                self.relaunch(&task_id, resumed).await;
            }
            Internal::ReloadFinished { epoch, restarted } => {
                if epoch == self.reload_epoch {
                    tracing::info!(restarted, "Reload completed");
                    self.events.broadcast(&WatchEvent::ReloadCompleted { restarted });
                }
            }
        }
    }

    async fn create(&mut self, spec: TaskSpec) -> Result<Task, WatchError> {
        let task = self.registry.create(spec).await?;
        self.events.broadcast(&WatchEvent::TaskCreated { task: task.clone() });
        self.launch(&task, false);
        Ok(task)
    }

    /// 为任务建立新一代监视会话，在独立任务中 start()
    fn launch(&mut self, task: &Task, resumed: bool) {
        let generation = self.next_generation;
        self.next_generation += 1;

        let session = WatchSession::new(
            task,
            generation,
            self.config.watch.clone(),
            Arc::clone(&self.provider),
            self.admission.clone(),
            self.found_tx.clone(),
        );
        self.active.insert(
            task.id.clone(),
            ActiveWatch {
                generation,
                session: Arc::clone(&session),
            },
        );
        tracing::debug!(task_id = %task.id, generation, resumed, "Launching watch session");

        let tx = self.internal_tx.clone();
        let task_id = task.id.clone();
        tokio::spawn(async move {
            let result = session.start().await;
            let _ = tx.send(Internal::Started {
                task_id,
                generation,
                resumed,
                result,
            });
        });
    }

    /// 错峰重启到点：任务仍需监视且当前没有会话时才启动
    async fn relaunch(&mut self, task_id: &str, resumed: bool) {
        if self.active.contains_key(task_id) {
            return;
        }
        let Some(task) = self.registry.get(task_id).await else {
            return;
        };
        if !task.status.is_resumable() {
            return;
        }
        let task = match self
            .registry
            .update(task_id, |t| t.status = TaskStatus::Starting)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(task_id, "Relaunch skipped: {}", e);
                return;
            }
        };
        self.launch(&task, resumed);
    }

    async fn on_started(
        &mut self,
        task_id: TaskId,
        generation: u64,
        resumed: bool,
        result: Result<(), WatchError>,
    ) {
        let current = self
            .active
            .get(&task_id)
            .map(|a| a.generation == generation)
            .unwrap_or(false);
        if !current {
            tracing::debug!(task_id = %task_id, generation, "Ignoring stale start outcome");
            return;
        }

        match result {
            Ok(()) => {
                let updated = self
                    .registry
                    .update(&task_id, |t| {
                        if t.status == TaskStatus::Starting {
                            t.status = TaskStatus::Running;
                            t.error = None;
                        }
                    })
                    .await;
                match updated {
                    Ok(task) if task.status == TaskStatus::Running => {
                        tracing::info!(task_id = %task_id, generation, "Task running");
                        let event = if resumed {
                            WatchEvent::TaskResumed { task }
                        } else {
                            WatchEvent::TaskStarted { task }
                        };
                        self.events.broadcast(&event);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(task_id = %task_id, "Start outcome for missing task: {}", e),
                }
            }
            Err(e) => {
                if let Some(active) = self.active.remove(&task_id) {
                    active.session.stop().await;
                }
                tracing::warn!(task_id = %task_id, generation, "Task start failed: {}", e);
                let reason = e.to_string();
                if let Err(err) = self
                    .registry
                    .update_now(&task_id, |t| t.mark_error(reason.clone()))
                    .await
                {
                    tracing::warn!(task_id = %task_id, "Could not record start failure: {}", err);
                    return;
                }
                self.events.broadcast(&WatchEvent::Error {
                    task_id: Some(task_id),
                    message: reason,
                });
            }
        }
    }

    /// 发现通知：只对当前 generation 且尚未 found 的任务生效一次
    async fn on_found(&mut self, notice: FoundNotice) {
        let session = match self.active.get(&notice.task_id) {
            Some(a) if a.generation == notice.generation => Arc::clone(&a.session),
            _ => {
                tracing::debug!(task_id = %notice.task_id, generation = notice.generation, "Ignoring stale found notice");
                return;
            }
        };
        let Some(task) = self.registry.get(&notice.task_id).await else {
            return;
        };
        if task.status == TaskStatus::Found {
            return;
        }

        let mut href = notice.href.trim().to_string();
        if href.is_empty() {
            href = match session.probe_href().await {
                Some(h) if !h.trim().is_empty() => h.trim().to_string(),
                _ => {
                    tracing::warn!(task_id = %task.id, "Found without href, falling back to target url");
                    task.target_url.clone()
                }
            };
        }

        if task.status == TaskStatus::Starting {
            if let Ok(task) = self
                .registry
                .update(&task.id, |t| t.status = TaskStatus::Running)
                .await
            {
                self.events.broadcast(&WatchEvent::TaskStarted { task });
            }
        }

        let found = match self
            .registry
            .update_now(&task.id, |t| t.mark_found(href.clone()))
            .await
        {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(task_id = %task.id, "Could not record found state: {}", e);
                return;
            }
        };
        tracing::info!(task_id = %found.id, href = %href, instance = notice.instance, "Task found");

        self.events.broadcast(&WatchEvent::TaskFound { task: found.clone() });
        self.events.broadcast(&WatchEvent::AlarmStarted {
            task_id: found.id.clone(),
            href,
            identifier: found.identifier.clone(),
        });

        let automation = Arc::clone(&self.automation);
        let automated = found.clone();
        tokio::spawn(async move {
            match automation.run(&automated).await {
                Ok(result) => tracing::info!(task_id = %automated.id, automation = automation.name(), result = %result, "Automation finished"),
                Err(e) => tracing::warn!(task_id = %automated.id, automation = automation.name(), "Automation failed: {}", e),
            }
        });

        if let Some(active) = self.active.remove(&found.id) {
            active.session.stop().await;
        }
    }

    async fn stop(&mut self, id: &str) -> Result<Task, WatchError> {
        if self.registry.get(id).await.is_none() {
            return Err(WatchError::NotFound(id.to_string()));
        }
        if let Some(active) = self.active.remove(id) {
            active.session.stop().await;
        }
        let task = self
            .registry
            .update_now(id, |t| {
                if t.status != TaskStatus::Found {
                    t.status = TaskStatus::Stopped;
                }
            })
            .await?;
        tracing::info!(task_id = %id, status = %task.status, "Task stopped");
        self.events.broadcast(&WatchEvent::TaskStopped { task: task.clone() });
        Ok(task)
    }

    async fn delete(&mut self, id: &str) -> Result<(), WatchError> {
        if self.registry.get(id).await.is_none() {
            return Err(WatchError::NotFound(id.to_string()));
        }
        if let Some(active) = self.active.remove(id) {
            active.session.stop().await;
        }
        self.registry.remove(id).await?;
        self.events.broadcast(&WatchEvent::TaskDeleted {
            task_id: id.to_string(),
        });
        Ok(())
    }

    /// 停止全部会话，暂停后错峰重启所有 starting / running 任务
    async fn reload(&mut self, id: &str) -> Result<usize, WatchError> {
        if self.registry.get(id).await.is_none() {
            return Err(WatchError::NotFound(id.to_string()));
        }
        self.reload_epoch += 1;
        let epoch = self.reload_epoch;

        let stopped = self.stop_all().await;
        let ids = self.registry.resumable_ids().await;
        tracing::info!(epoch, stopped, pending = ids.len(), "Global reload");

        let count = ids.len();
        self.schedule_launches(ids, epoch, false, self.config.reload_pause, true);
        Ok(count)
    }

    /// 启动时恢复：状态重置为 starting，错峰启动
    async fn resume_all(&mut self) {
        let ids = self.registry.resumable_ids().await;
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "Resuming tasks from snapshot");
        for id in &ids {
            if let Err(e) = self
                .registry
                .update(id, |t| t.status = TaskStatus::Starting)
                .await
            {
                tracing::warn!(task_id = %id, "Resume reset failed: {}", e);
            }
        }
        let epoch = self.reload_epoch;
        self.schedule_launches(ids, epoch, true, Duration::ZERO, false);
    }

    fn schedule_launches(
        &self,
        ids: Vec<TaskId>,
        epoch: u64,
        resumed: bool,
        pause: Duration,
        report: bool,
    ) {
        let tx = self.internal_tx.clone();
        let stagger = self.config.restart_stagger;
        let cancel = self.background.clone();
        tokio::spawn(async move {
            let restarted = ids.len();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(pause) => {}
            }
            for (i, task_id) in ids.into_iter().enumerate() {
                if i > 0 {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(stagger) => {}
                    }
                }
                if tx
                    .send(Internal::Launch {
                        task_id,
                        epoch,
                        resumed,
                    })
                    .is_err()
                {
                    return;
                }
            }
            if report {
                let _ = tx.send(Internal::ReloadFinished { epoch, restarted });
            }
        });
    }

    async fn stop_all(&mut self) -> usize {
        let active: Vec<_> = self.active.drain().collect();
        let count = active.len();
        for (task_id, watch) in active {
            watch.session.stop().await;
            tracing::debug!(task_id = %task_id, generation = watch.generation, "Watch session stopped");
        }
        count
    }

    async fn snapshot(&self) -> OrchestratorSnapshot {
        let mut sessions: Vec<_> = self.active.values().map(|a| a.session.info()).collect();
        sessions.sort_by_key(|s| s.generation);
        let stats = self.registry.persistence().stats();
        OrchestratorSnapshot {
            provider: self.provider.name().to_string(),
            tasks: self.registry.list(TaskFilter::All).await,
            sessions,
            admission: AdmissionUsage {
                ceiling: self.admission.ceiling(),
                in_use: self.admission.in_use(),
                high_water: self.admission.high_water(),
            },
            persistence: PersistenceUsage {
                path: self.store_path.clone(),
                writes: stats.writes(),
                failures: stats.failures(),
            },
            subscribers: self.events.subscriber_count(),
            reload_epoch: self.reload_epoch,
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!(active = self.active.len(), "Orchestrator shutting down");
        self.background.cancel();
        self.stop_all().await;
        self.admission.close();
        if let Err(e) = self.registry.flush().await {
            tracing::error!("Final snapshot write failed: {}", e);
        }
        self.provider.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::NoopAutomation;
    use crate::provider::MockSessionProvider;

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            watch: WatchConfig {
                reload_interval: Duration::from_millis(50),
                rotation_interval: Duration::ZERO,
                navigation_timeout: Duration::from_millis(200),
                stable_timeout: Duration::from_millis(20),
                navigation_retries: 1,
                rotation_admission_timeout: Duration::from_millis(100),
            },
            max_concurrent_sessions: 3,
            reload_pause: Duration::from_millis(20),
            restart_stagger: Duration::from_millis(10),
            persist_debounce: Duration::from_millis(20),
            resume_on_start: true,
        }
    }

    async fn wait_status(orch: &Orchestrator, id: &str, status: TaskStatus) -> bool {
        for _ in 0..100 {
            if orch.get_task(id).await.map(|t| t.status) == Some(status) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_create_reaches_running() {
        let provider = MockSessionProvider::new();
        let orch = Orchestrator::init(
            test_config(),
            SnapshotStore::in_memory(),
            Arc::new(provider.clone()),
            Arc::new(NoopAutomation),
        )
        .await
        .unwrap();

        let task = orch
            .create_task(TaskSpec::new("https://example.com/a", "A1"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Starting);
        assert!(wait_status(&orch, &task.id, TaskStatus::Running).await);

        let snap = orch.snapshot().await.unwrap();
        assert_eq!(snap.sessions.len(), 1);
        assert_eq!(snap.provider, "mock");
        orch.shutdown().await;
        assert_eq!(provider.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let orch = Orchestrator::init(
            test_config(),
            SnapshotStore::in_memory(),
            Arc::new(MockSessionProvider::new()),
            Arc::new(NoopAutomation),
        )
        .await
        .unwrap();

        assert!(matches!(orch.stop_task("nope").await, Err(WatchError::NotFound(_))));
        assert!(matches!(orch.delete_task("nope").await, Err(WatchError::NotFound(_))));
        assert!(matches!(orch.reload_task("nope").await, Err(WatchError::NotFound(_))));
        assert!(matches!(
            orch.create_task(TaskSpec::new("", "A1")).await,
            Err(WatchError::Validation(_))
        ));
        orch.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_are_closed() {
        let orch = Orchestrator::init(
            test_config(),
            SnapshotStore::in_memory(),
            Arc::new(MockSessionProvider::new()),
            Arc::new(NoopAutomation),
        )
        .await
        .unwrap();
        orch.shutdown().await;
        orch.shutdown().await;
        assert!(matches!(orch.snapshot().await, Err(WatchError::Closed(_))));
    }
}
