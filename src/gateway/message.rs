//! HTTP 接口的请求 / 响应格式
//!
//! 状态变更接口统一返回 `{ "success": true, ... }` 或 `{ "success": false, "reason": "..." }`。

use serde::{Deserialize, Serialize};

use crate::core::{Task, TaskId, WatchError};

/// GET /api/tasks 查询参数
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    /// all / active
    pub filter: Option<String>,
}

/// POST /api/tasks 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub success: bool,
    pub task_id: TaskId,
    pub task: Task,
}

/// GET /api/tasks 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListResponse {
    pub success: bool,
    pub tasks: Vec<Task>,
}

/// stop 响应：停止后的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResponse {
    pub success: bool,
    pub task: Task,
}

/// reload 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub success: bool,
    /// 排队错峰重启的任务数
    pub restarting: usize,
}

/// 无附加数据的成功响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub success: bool,
}

impl AckResponse {
    pub fn ok() -> Self {
        Self { success: true }
    }
}

/// 失败响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub reason: String,
    /// 错误类别（validation / not_found / ...）
    pub kind: String,
}

impl From<&WatchError> for ErrorResponse {
    fn from(e: &WatchError) -> Self {
        Self {
            success: false,
            reason: e.to_string(),
            kind: e.kind().to_string(),
        }
    }
}
