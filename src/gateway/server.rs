//! axum 路由：任务管理 + SSE 事件推送 + 调试视图

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream;
use tokio_util::sync::CancellationToken;

use super::message::{
    AckResponse, CreateTaskResponse, ErrorResponse, ListQuery, ReloadResponse, TaskListResponse,
    TaskResponse,
};
use crate::core::{Orchestrator, OrchestratorSnapshot, TaskFilter, TaskSpec, WatchError};

struct AppState {
    orchestrator: Orchestrator,
    /// 关停时结束 SSE 连接，否则 graceful shutdown 会一直等
    shutdown: CancellationToken,
}

/// 错误 → HTTP 状态码 + `{success:false, reason}`
pub struct ApiError(WatchError);

impl From<WatchError> for ApiError {
    fn from(e: WatchError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            WatchError::Validation(_) => StatusCode::BAD_REQUEST,
            WatchError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorResponse::from(&self.0))).into_response()
    }
}

pub fn router(orchestrator: Orchestrator) -> Router {
    router_with_shutdown(orchestrator, CancellationToken::new())
}

pub fn router_with_shutdown(orchestrator: Orchestrator, shutdown: CancellationToken) -> Router {
    let state = Arc::new(AppState {
        orchestrator,
        shutdown,
    });
    Router::new()
        .route("/api/tasks", get(api_tasks_list).post(api_tasks_create))
        .route("/api/tasks/:id", axum::routing::delete(api_tasks_delete))
        .route("/api/tasks/:id/stop", post(api_tasks_stop))
        .route("/api/tasks/:id/reload", post(api_tasks_reload))
        .route("/api/events", get(api_events_sse))
        .route("/api/debug", get(api_debug))
        .route("/api/health", get(|| async { "OK" }))
        .with_state(state)
}

/// 绑定地址并运行，直到 shutdown 被取消
pub async fn serve(
    bind: &str,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("linkwatch listening on http://{}", listener.local_addr()?);

    let app = router_with_shutdown(orchestrator, shutdown.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// POST /api/tasks
async fn api_tasks_create(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TaskSpec>, JsonRejection>,
) -> Result<(StatusCode, Json<CreateTaskResponse>), ApiError> {
    let Json(spec) = body.map_err(|e| WatchError::Validation(e.body_text()))?;
    let task = state.orchestrator.create_task(spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            success: true,
            task_id: task.id.clone(),
            task,
        }),
    ))
}

/// GET /api/tasks?filter=active|all
async fn api_tasks_list(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<TaskListResponse>, ApiError> {
    let filter: TaskFilter = query.filter.as_deref().unwrap_or("").parse()?;
    let tasks = state.orchestrator.list_tasks(filter).await;
    Ok(Json(TaskListResponse {
        success: true,
        tasks,
    }))
}

/// POST /api/tasks/:id/stop
async fn api_tasks_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let task = state.orchestrator.stop_task(&id).await?;
    Ok(Json(TaskResponse {
        success: true,
        task,
    }))
}

/// DELETE /api/tasks/:id
async fn api_tasks_delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AckResponse>, ApiError> {
    state.orchestrator.delete_task(&id).await?;
    Ok(Json(AckResponse::ok()))
}

/// POST /api/tasks/:id/reload：全局重启所有监视
async fn api_tasks_reload(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let restarting = state.orchestrator.reload_task(&id).await?;
    Ok(Json(ReloadResponse {
        success: true,
        restarting,
    }))
}

/// GET /api/debug
async fn api_debug(
    State(state): State<Arc<AppState>>,
) -> Result<Json<OrchestratorSnapshot>, ApiError> {
    Ok(Json(state.orchestrator.snapshot().await?))
}

/// GET /api/events：SSE 推送任务事件
async fn api_events_sse(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures_util::Stream<Item = Result<Event, std::convert::Infallible>>> {
    let subscription = state.orchestrator.subscribe();
    let shutdown = state.shutdown.clone();
    let event_stream = stream::unfold(
        (subscription, shutdown),
        |(mut subscription, shutdown)| async move {
            let msg = tokio::select! {
                _ = shutdown.cancelled() => None,
                msg = subscription.recv() => msg,
            }?;
            Some((Ok(Event::default().data(msg)), (subscription, shutdown)))
        },
    );
    Sse::new(event_stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    )
}
