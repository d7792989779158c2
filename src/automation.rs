//! 下游自动化：发现目标后触发一次
//!
//! 编排器以 fire-and-forget 方式调用，结果只写日志，不影响任务状态。
//! - `NoopAutomation`：只记录日志
//! - `WebhookAutomation`：把任务 JSON POST 到配置的地址（带超时）

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::core::Task;

/// 自动化动作
#[async_trait]
pub trait Automation: Send + Sync {
    /// 执行一次，返回简短结果描述
    async fn run(&self, task: &Task) -> anyhow::Result<String>;

    fn name(&self) -> &str;
}

/// 默认实现：只写日志
#[derive(Debug, Default, Clone)]
pub struct NoopAutomation;

#[async_trait]
impl Automation for NoopAutomation {
    async fn run(&self, task: &Task) -> anyhow::Result<String> {
        tracing::info!(
            task_id = %task.id,
            href = task.found_href.as_deref().unwrap_or(""),
            "Automation skipped (noop)"
        );
        Ok("noop".to_string())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Webhook：POST 任务 JSON
pub struct WebhookAutomation {
    client: Client,
    url: String,
}

impl WebhookAutomation {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("linkwatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Automation for WebhookAutomation {
    async fn run(&self, task: &Task) -> anyhow::Result<String> {
        let response = self.client.post(&self.url).json(task).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("webhook returned {}: {}", status, body.chars().take(200).collect::<String>());
        }
        Ok(format!("webhook {}", status.as_u16()))
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
