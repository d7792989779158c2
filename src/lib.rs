//! Linkwatch - 动态链接监视器
//!
//! 多个目标页面并发监视，页面上出现包含标识串的链接时立即提醒并触发下游自动化。
//!
//! 模块划分：
//! - **automation**: 发现后的下游动作（Noop / Webhook）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、注册表与持久化、准入控制、监视会话、事件广播、编排器
//! - **gateway**: HTTP API + SSE（feature "web"）
//! - **observability**: 日志初始化
//! - **provider**: 浏览会话提供者（Headless Chrome / Mock）与探测脚本

pub mod automation;
pub mod config;
pub mod core;
#[cfg(feature = "web")]
pub mod gateway;
pub mod observability;
pub mod provider;

pub use crate::core::{Orchestrator, OrchestratorConfig, Task, TaskSpec, TaskStatus, WatchError};
