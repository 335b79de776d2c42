//! 核心编排层：错误与恢复、运行状态、过程事件、主控循环与构建器

pub mod builder;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use builder::{create_llm_from_config, default_tool_registry, OrchestratorBuilder};
pub use error::{ErrorKind, OrchestratorError, RecoveryAction};
pub use events::{EventSender, RunEvent};
pub use orchestrator::Orchestrator;
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::{Note, NoteSource, RunReport, RunState, RunStatus, Terminal};
