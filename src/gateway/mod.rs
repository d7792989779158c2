//! HTTP 网关（feature "web"）
//!
//! - `POST /api/tasks` 创建任务
//! - `GET /api/tasks?filter=active|all` 列表
//! - `POST /api/tasks/:id/stop`、`DELETE /api/tasks/:id`
//! - `POST /api/tasks/:id/reload` 全局重启监视
//! - `GET /api/events` SSE 事件流
//! - `GET /api/debug` 编排器内部状态
//! - `GET /api/health`

mod message;
mod server;

pub use message::{
    AckResponse, CreateTaskResponse, ErrorResponse, ListQuery, ReloadResponse, TaskListResponse,
    TaskResponse,
};
pub use server::{router, router_with_shutdown, serve, ApiError};
