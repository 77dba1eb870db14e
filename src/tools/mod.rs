//! 工具层：注册表、参数 schema 与校验、用户确认、执行管线

pub mod confirmation;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod schema;

pub use confirmation::{Approval, AutoApprove, ConfirmationChannel, ConfirmationPolicy, DenyAll};
pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use registry::{Tool, ToolRegistry, ToolSchema};
pub use schema::{schema_of, validate_arguments};
