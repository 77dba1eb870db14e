//! 工具调用确认
//!
//! requires_confirmation 的工具在执行前通过 ConfirmationChannel 询问用户：
//! approved 仅放行本次，approved_always 在本会话内记住该工具，rejected 转为 user_rejected 结果。

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::memory::ToolInvocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Approval {
    Approved,
    ApprovedAlways,
    Rejected,
}

/// 向用户请求确认的通道（TUI / CLI / 网关各自实现）
#[async_trait]
pub trait ConfirmationChannel: Send + Sync {
    async fn request_approval(&self, invocation: &ToolInvocation) -> Approval;
}

/// 全部放行
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ConfirmationChannel for AutoApprove {
    async fn request_approval(&self, _invocation: &ToolInvocation) -> Approval {
        Approval::Approved
    }
}

/// 全部拒绝（无交互环境）
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

#[async_trait]
impl ConfirmationChannel for DenyAll {
    async fn request_approval(&self, _invocation: &ToolInvocation) -> Approval {
        Approval::Rejected
    }
}

/// 会话级确认状态
#[derive(Debug, Clone, Default)]
pub struct ConfirmationPolicy {
    auto_approve: bool,
    always_approved: HashSet<String>,
}

impl ConfirmationPolicy {
    pub fn new(auto_approve: bool) -> Self {
        Self {
            auto_approve,
            always_approved: HashSet::new(),
        }
    }

    /// 该工具本次是否需要询问
    pub fn needs_approval(&self, tool_name: &str, requires_confirmation: bool) -> bool {
        requires_confirmation && !self.auto_approve && !self.always_approved.contains(tool_name)
    }

    /// 记录用户决定；approved_always 之后同名工具不再询问
    pub fn remember(&mut self, tool_name: &str, approval: Approval) {
        if approval == Approval::ApprovedAlways {
            self.always_approved.insert(tool_name.to_string());
        }
    }
}
