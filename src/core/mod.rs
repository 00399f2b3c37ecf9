//! 核心编排层：引擎主循环、错误分类、状态投影、会话监管、并发槽位、前端 API

pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;
pub mod task_scheduler;

pub use engine::{new_session_id, Engine, TickSummary};
pub use error::{FailureKind, FailureReason, OrchestratorError};
pub use orchestrator::{create_orchestrator, open_store, Command, Orchestrator};
pub use session_supervisor::{PauseReason, SessionSupervisor};
pub use state::{EnginePhase, LiveWorker, SessionMeta, StatusReport, TaskStatusLine, TaskStatusRecord};
pub use task_scheduler::WorkerPool;
