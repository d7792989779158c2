//! Linkwatch 入口：加载配置、初始化日志、启动编排器与 HTTP 服务，收到信号后优雅关闭。
//!
//! 用法：`linkwatch [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use linkwatch::automation::{Automation, NoopAutomation, WebhookAutomation};
use linkwatch::config::{load_config, AppConfig};
use linkwatch::core::{
    Orchestrator, OrchestratorCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
    SnapshotStore,
};
use linkwatch::provider::create_provider_from_config;

fn create_automation(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Automation>> {
    match cfg.automation.webhook_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => {
            tracing::info!(url, "Using webhook automation");
            let hook = WebhookAutomation::new(url, Duration::from_secs(cfg.automation.timeout_secs))
                .context("Failed to build webhook client")?;
            Ok(Arc::new(hook))
        }
        _ => Ok(Arc::new(NoopAutomation)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    linkwatch::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let provider = create_provider_from_config(&cfg)?;
    let automation = create_automation(&cfg)?;
    let store = SnapshotStore::new(&cfg.persistence.path);

    let orchestrator = Orchestrator::init(cfg.orchestrator(), store, provider, automation)
        .await
        .context("Failed to start orchestrator")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let mut coordinator = ShutdownCoordinator::new(&shutdown)
        .with_timeout(Duration::from_secs(cfg.app.shutdown_timeout_secs));
    coordinator.register(OrchestratorCleanup::new(orchestrator.clone()));

    let result = linkwatch::gateway::serve(&cfg.server.bind, orchestrator, shutdown.token()).await;
    if let Err(ref e) = result {
        tracing::error!("HTTP server stopped: {}", e);
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
    }

    if let Some(reason) = coordinator.run_cleanup().await {
        tracing::info!(?reason, "linkwatch stopped");
    }
    result
}
