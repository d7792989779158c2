//! 核心编排层：任务模型、注册表与持久化、准入控制、监视会话、事件广播、主控循环

pub mod admission;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod task;
pub mod watch_session;

pub use admission::{SessionAdmission, SessionPermit};
pub use error::WatchError;
pub use events::{EventBroadcaster, Subscription, WatchEvent};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use persistence::{PersistenceHandle, SnapshotStore};
pub use registry::{TaskFilter, TaskRegistry};
pub use shutdown::{OrchestratorCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::OrchestratorSnapshot;
pub use task::{Task, TaskId, TaskSpec, TaskStatus};
pub use watch_session::{FoundNotice, WatchConfig, WatchPhase, WatchSession, WatchSessionInfo};
