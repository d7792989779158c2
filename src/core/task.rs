//! 监视任务数据模型
//!
//! Task 是持久化的基本单位；活跃会话句柄不在此处（由编排器持有），快照只包含纯数据。

use serde::{Deserialize, Serialize};

use super::error::WatchError;

/// 任务 ID
pub type TaskId = String;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// 已创建 / 正在附着会话
    Starting,
    /// 会话已附着，探测器在等待
    Running,
    /// 已发现目标链接（终态）
    Found,
    /// 被显式停止
    Stopped,
    /// 初次启动失败
    Error,
}

impl TaskStatus {
    /// 列表 active 过滤条件：starting / running / found
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Starting | TaskStatus::Running | TaskStatus::Found)
    }

    /// 进程重启后需要恢复监视的状态
    pub fn is_resumable(&self) -> bool {
        matches!(self, TaskStatus::Starting | TaskStatus::Running)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Starting => write!(f, "starting"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Found => write!(f, "found"),
            TaskStatus::Stopped => write!(f, "stopped"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

/// 创建任务的请求参数
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSpec {
    /// 目标页面
    pub target_url: String,
    /// 探测器要寻找的标识串
    pub identifier: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    /// 探测器作用范围（CSS 选择器），不解释，原样透传
    #[serde(default)]
    pub container: Option<String>,
    /// 下游自动化参数，原样透传
    #[serde(default)]
    pub automation: Option<serde_json::Value>,
}

impl TaskSpec {
    pub fn new(target_url: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    /// 目标地址与标识串必须非空
    pub fn validate(&self) -> Result<(), WatchError> {
        if self.target_url.trim().is_empty() {
            return Err(WatchError::Validation("target_url is required".to_string()));
        }
        if self.identifier.trim().is_empty() {
            return Err(WatchError::Validation("identifier is required".to_string()));
        }
        Ok(())
    }
}

/// 监视任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub venue: Option<String>,
    pub target_url: String,
    pub identifier: String,
    #[serde(default)]
    pub container: Option<String>,
    pub status: TaskStatus,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    /// 发现的链接；当且仅当 status == Found 时存在
    #[serde(default)]
    pub found_href: Option<String>,
    #[serde(default)]
    pub found_at: Option<i64>,
    /// 最近一次启动失败原因
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub automation: Option<serde_json::Value>,
}

impl Task {
    pub fn new(spec: TaskSpec) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            location: spec.location,
            venue: spec.venue,
            target_url: spec.target_url.trim().to_string(),
            identifier: spec.identifier.trim().to_string(),
            container: spec.container,
            status: TaskStatus::Starting,
            created_at: now,
            updated_at: now,
            found_href: None,
            found_at: None,
            error: None,
            automation: spec.automation,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    /// 标记为已发现：同时写入 href，保持 status/found_href 一致
    pub fn mark_found(&mut self, href: String) {
        self.status = TaskStatus::Found;
        self.found_href = Some(href);
        self.found_at = Some(chrono::Utc::now().timestamp_millis());
        self.error = None;
    }

    pub fn mark_error(&mut self, reason: String) {
        self.status = TaskStatus::Error;
        self.error = Some(reason);
        self.found_href = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_validation() {
        assert!(TaskSpec::new("https://example.com", "X123").validate().is_ok());
        assert!(matches!(
            TaskSpec::new("  ", "X123").validate(),
            Err(WatchError::Validation(_))
        ));
        assert!(matches!(
            TaskSpec::new("https://example.com", "").validate(),
            Err(WatchError::Validation(_))
        ));
    }

    #[test]
    fn test_new_task_starts_in_starting() {
        let task = Task::new(TaskSpec {
            venue: Some("Hall A".to_string()),
            ..TaskSpec::new(" https://example.com/shows ", "X123")
        });
        assert!(task.id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Starting);
        assert_eq!(task.target_url, "https://example.com/shows");
        assert_eq!(task.venue.as_deref(), Some("Hall A"));
        assert!(task.found_href.is_none());
    }

    #[test]
    fn test_status_filters() {
        assert!(TaskStatus::Found.is_active());
        assert!(!TaskStatus::Found.is_resumable());
        assert!(TaskStatus::Running.is_resumable());
        assert!(!TaskStatus::Stopped.is_active());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
