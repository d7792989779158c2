//! 调试 / 自省视图：编排器内部状态的只读投影
//!
//! 只包含纯数据，可直接序列化给 `/api/debug`。

use serde::Serialize;

use super::task::Task;
use super::watch_session::WatchSessionInfo;

/// 准入控制占用情况
#[derive(Clone, Debug, Default, Serialize)]
pub struct AdmissionUsage {
    pub ceiling: usize,
    pub in_use: usize,
    pub high_water: usize,
}

/// 持久化统计
#[derive(Clone, Debug, Default, Serialize)]
pub struct PersistenceUsage {
    pub path: Option<String>,
    pub writes: u64,
    pub failures: u64,
}

/// 编排器快照
#[derive(Clone, Debug, Serialize)]
pub struct OrchestratorSnapshot {
    pub provider: String,
    pub tasks: Vec<Task>,
    /// 当前持有监视会话的任务
    pub sessions: Vec<WatchSessionInfo>,
    pub admission: AdmissionUsage,
    pub persistence: PersistenceUsage,
    pub subscribers: usize,
    /// 全局 reload 次数
    pub reload_epoch: u64,
}
