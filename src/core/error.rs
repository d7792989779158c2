//! 监视错误类型
//!
//! 与编排器的传播策略配合：初次启动失败 → 任务状态 error；刷新 / 轮换失败 → 吸收并在下个周期重试；
//! 自动化与事件序列化失败 → 永不回写任务状态。

use thiserror::Error;

/// 监视过程中可能出现的错误（校验、会话获取、导航、注入、持久化等）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    /// 任务参数不合法，在触碰任何资源之前拒绝
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session acquisition failed: {0}")]
    SessionAcquisition(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Detector injection failed: {0}")]
    Injection(String),

    #[error("Task not found: {0}")]
    NotFound(String),

    /// 持久化失败只记录日志，不阻塞内存状态推进
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// 启动过程中被 stop() 取消
    #[error("Watch cancelled")]
    Cancelled,

    /// 编排器或会话已关闭
    #[error("Closed: {0}")]
    Closed(String),
}

impl WatchError {
    /// 错误类别（用于 API 返回与事件）
    pub fn kind(&self) -> &'static str {
        match self {
            WatchError::Validation(_) => "validation",
            WatchError::SessionAcquisition(_) => "session_acquisition",
            WatchError::Navigation(_) => "navigation",
            WatchError::Injection(_) => "injection",
            WatchError::NotFound(_) => "not_found",
            WatchError::Persistence(_) => "persistence",
            WatchError::Cancelled => "cancelled",
            WatchError::Closed(_) => "closed",
        }
    }

    /// 是否可在下个刷新 / 轮换周期自动恢复
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WatchError::SessionAcquisition(_) | WatchError::Navigation(_) | WatchError::Injection(_)
        )
    }
}

impl From<std::io::Error> for WatchError {
    fn from(e: std::io::Error) -> Self {
        WatchError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for WatchError {
    fn from(e: serde_json::Error) -> Self {
        WatchError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_and_recoverable() {
        assert_eq!(WatchError::Validation("x".into()).kind(), "validation");
        assert!(WatchError::Navigation("timeout".into()).is_recoverable());
        assert!(!WatchError::NotFound("task_1".into()).is_recoverable());
    }

    #[test]
    fn test_io_error_maps_to_persistence() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: WatchError = io.into();
        assert_eq!(err.kind(), "persistence");
        assert!(err.to_string().contains("denied"));
    }
}
