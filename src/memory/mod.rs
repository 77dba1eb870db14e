//! 记忆层：会话内对话历史与 Token 预算（单进程单会话，不做跨会话持久化）

pub mod conversation;
pub mod token_budget;

pub use conversation::{
    check_pairing, Conversation, Message, PairingViolation, Role, ToolErrorKind, ToolInvocation,
    ToolResult, ToolStatus,
};
pub use token_budget::{Compressed, CompressionStrategy, TokenBudget, TokenEstimator};
