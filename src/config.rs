//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `LINKWATCH__*` 覆盖（双下划线表示嵌套，如 `LINKWATCH__WATCH__RELOAD_INTERVAL_MS=2000`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{OrchestratorConfig, WatchConfig};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub watch: WatchSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub browser: BrowserSection,
    #[serde(default)]
    pub automation: AutomationSection,
}

/// [app] 段：名称、会话提供者、启动恢复、关停超时
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    pub name: Option<String>,
    /// 会话提供者：chrome / mock；未设置时有 browser feature 用 chrome，否则 mock
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 启动时恢复 starting / running 任务
    #[serde(default = "default_true")]
    pub resume_on_start: bool,
    /// 每个关停清理步骤的超时
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            provider: default_provider(),
            resume_on_start: true,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    if cfg!(feature = "browser") {
        "chrome".to_string()
    } else {
        "mock".to_string()
    }
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

/// [watch] 段：监视节奏、超时与并发上限（毫秒）
#[derive(Debug, Clone, Deserialize)]
pub struct WatchSection {
    #[serde(default = "default_reload_interval_ms")]
    pub reload_interval_ms: u64,
    /// 0 表示关闭轮换
    #[serde(default = "default_rotation_interval_ms")]
    pub rotation_interval_ms: u64,
    #[serde(default = "default_navigation_timeout_ms")]
    pub navigation_timeout_ms: u64,
    #[serde(default = "default_stable_timeout_ms")]
    pub stable_timeout_ms: u64,
    #[serde(default = "default_navigation_retries")]
    pub navigation_retries: u32,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_reload_pause_ms")]
    pub reload_pause_ms: u64,
    #[serde(default = "default_restart_stagger_ms")]
    pub restart_stagger_ms: u64,
    /// 轮换等待并发名额的上限，超时跳过本轮
    #[serde(default = "default_rotation_admission_timeout_ms")]
    pub rotation_admission_timeout_ms: u64,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            reload_interval_ms: default_reload_interval_ms(),
            rotation_interval_ms: default_rotation_interval_ms(),
            navigation_timeout_ms: default_navigation_timeout_ms(),
            stable_timeout_ms: default_stable_timeout_ms(),
            navigation_retries: default_navigation_retries(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            reload_pause_ms: default_reload_pause_ms(),
            restart_stagger_ms: default_restart_stagger_ms(),
            rotation_admission_timeout_ms: default_rotation_admission_timeout_ms(),
        }
    }
}

fn default_reload_interval_ms() -> u64 {
    3_000
}

fn default_rotation_interval_ms() -> u64 {
    300_000
}

fn default_navigation_timeout_ms() -> u64 {
    30_000
}

fn default_stable_timeout_ms() -> u64 {
    10_000
}

fn default_navigation_retries() -> u32 {
    1
}

fn default_max_concurrent_sessions() -> usize {
    6
}

fn default_reload_pause_ms() -> u64 {
    1_000
}

fn default_restart_stagger_ms() -> u64 {
    500
}

fn default_rotation_admission_timeout_ms() -> u64 {
    30_000
}

/// [persistence] 段：快照文件与去抖
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSection {
    #[serde(default = "default_snapshot_path")]
    pub path: PathBuf,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            path: default_snapshot_path(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/tasks.json")
}

fn default_debounce_ms() -> u64 {
    250
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

/// [browser] 段：Headless Chrome 启动参数
#[derive(Debug, Clone, Deserialize)]
pub struct BrowserSection {
    #[serde(default = "default_true")]
    pub headless: bool,
    /// Chrome 可执行文件，未设置时自动探测
    pub executable: Option<PathBuf>,
    #[serde(default = "default_window_width")]
    pub window_width: u32,
    #[serde(default = "default_window_height")]
    pub window_height: u32,
    /// 浏览器空闲多久后断开（秒）
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl Default for BrowserSection {
    fn default() -> Self {
        Self {
            headless: true,
            executable: None,
            window_width: default_window_width(),
            window_height: default_window_height(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

fn default_window_width() -> u32 {
    1280
}

fn default_window_height() -> u32 {
    900
}

fn default_idle_timeout_secs() -> u64 {
    3_600
}

/// [automation] 段：发现后的下游动作
#[derive(Debug, Clone, Deserialize)]
pub struct AutomationSection {
    /// 设置后 POST 任务 JSON 到此地址，否则只记日志
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AutomationSection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

impl AppConfig {
    /// 转为编排器参数
    pub fn orchestrator(&self) -> OrchestratorConfig {
        let w = &self.watch;
        OrchestratorConfig {
            watch: WatchConfig {
                reload_interval: Duration::from_millis(w.reload_interval_ms),
                rotation_interval: Duration::from_millis(w.rotation_interval_ms),
                navigation_timeout: Duration::from_millis(w.navigation_timeout_ms),
                stable_timeout: Duration::from_millis(w.stable_timeout_ms),
                navigation_retries: w.navigation_retries,
                rotation_admission_timeout: Duration::from_millis(w.rotation_admission_timeout_ms),
            },
            max_concurrent_sessions: w.max_concurrent_sessions,
            reload_pause: Duration::from_millis(w.reload_pause_ms),
            restart_stagger: Duration::from_millis(w.restart_stagger_ms),
            persist_debounce: Duration::from_millis(self.persistence.debounce_ms),
            resume_on_start: self.app.resume_on_start,
        }
    }
}

/// 从 config 目录加载配置，环境变量 LINKWATCH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 LINKWATCH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("LINKWATCH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
