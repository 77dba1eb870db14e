//! 核心编排层：错误分类、回合状态、会话监管、命令通道编排器

pub mod error;
pub mod orchestrator;
pub mod session_supervisor;
pub mod state;

pub use error::AgentError;
pub use orchestrator::{spawn_session, Command};
pub use session_supervisor::SessionSupervisor;
pub use state::{Turn, TurnOutcome, TurnPhase};
