//! Agent 错误分类
//!
//! 工具级错误（UnknownTool / InvalidArguments / ToolExecutionFault / UserRejected）由执行管线
//! 转为 ToolResult 回灌给模型；Provider 与预算类错误终止当前回合；RoutingConfig / Config 仅在启动时出现。

use thiserror::Error;

/// Agent 运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 子代理路由模式非法（启动时致命）
    #[error("Routing config error: {0}")]
    RoutingConfig(String),

    /// 单次尝试的瞬时错误（限流、网络、超时、5xx）；重试耗尽后升级为 ProviderFatal
    #[error("Provider error (transient): {0}")]
    ProviderRetryable(String),

    #[error("Provider error: {0}")]
    ProviderFatal(String),

    #[error("Token budget exceeded: estimated {estimate} tokens, ceiling {ceiling}")]
    BudgetExceeded { estimate: usize, ceiling: usize },

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("Tool execution failed ({tool}): {message}")]
    ToolExecutionFault { tool: String, message: String },

    #[error("User rejected tool call: {0}")]
    UserRejected(String),

    #[error("Turn stopped after reaching the step limit ({0} model calls)")]
    TurnStepLimitExceeded(usize),

    #[error("Turn cancelled")]
    TurnCancelled,

    #[error("Config error: {0}")]
    Config(String),
}

impl AgentError {
    /// 稳定的错误类别名（事件流 turn_error.kind 使用）
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::RoutingConfig(_) => "routing_config_error",
            AgentError::ProviderRetryable(_) => "provider_retryable_error",
            AgentError::ProviderFatal(_) => "provider_fatal_error",
            AgentError::BudgetExceeded { .. } => "budget_exceeded",
            AgentError::UnknownTool(_) => "unknown_tool",
            AgentError::InvalidArguments { .. } => "invalid_arguments",
            AgentError::ToolExecutionFault { .. } => "tool_execution_fault",
            AgentError::UserRejected(_) => "user_rejected",
            AgentError::TurnStepLimitExceeded(_) => "turn_step_limit_exceeded",
            AgentError::TurnCancelled => "turn_cancelled",
            AgentError::Config(_) => "config_error",
        }
    }

    /// 是否属于工具级错误（应回灌模型而非终止回合）
    pub fn is_tool_level(&self) -> bool {
        matches!(
            self,
            AgentError::UnknownTool(_)
                | AgentError::InvalidArguments { .. }
                | AgentError::ToolExecutionFault { .. }
                | AgentError::UserRejected(_)
        )
    }
}
