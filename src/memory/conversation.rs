//! 短期记忆：对话历史
//!
//! 会话内的有序消息序列。assistant 消息携带本步的工具调用（ToolInvocation），
//! 紧随其后的 tool 消息按调用顺序各携带一个 ToolResult，二者以调用 id 配对。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    /// 仅用于压缩后的摘要说明
    System,
}

/// 模型发起的一次工具调用
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Provider 分配或编排器补齐的稳定 id
    pub id: String,
    pub tool_name: String,
    /// 通常为 JSON 对象；协议给出的参数串无法解析时保留为原始字符串
    pub arguments: Value,
}

impl ToolInvocation {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
}

/// 工具结果的错误类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidArguments,
    ExecutionFailed,
    UserRejected,
    /// 取消时未执行的调用（显式跳过标记）
    Skipped,
}

impl ToolErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::InvalidArguments => "invalid_arguments",
            ToolErrorKind::ExecutionFailed => "execution_failed",
            ToolErrorKind::UserRejected => "user_rejected",
            ToolErrorKind::Skipped => "skipped",
        }
    }
}

/// 单次工具调用的归一化结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub invocation_id: String,
    pub status: ToolStatus,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
}

impl ToolResult {
    pub fn ok(invocation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            status: ToolStatus::Ok,
            payload,
            error_kind: None,
        }
    }

    pub fn error(
        invocation_id: impl Into<String>,
        kind: ToolErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            status: ToolStatus::Error,
            payload: Value::String(message.into()),
            error_kind: Some(kind),
        }
    }

    pub fn skipped(invocation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::error(invocation_id, ToolErrorKind::Skipped, reason)
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    pub fn is_skipped(&self) -> bool {
        self.error_kind == Some(ToolErrorKind::Skipped)
    }

    /// payload 的文本形式（字符串原样，结构化值序列化为 JSON）
    pub fn payload_text(&self) -> String {
        match &self.payload {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// 回灌给模型的文本：失败时带上错误类别，便于模型调整
    pub fn model_text(&self) -> String {
        match self.error_kind {
            None => self.payload_text(),
            Some(kind) => format!("Error ({}): {}", kind.as_str(), self.payload_text()),
        }
    }
}

/// 单条消息（按角色区分的变体）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        invocations: Vec<ToolInvocation>,
    },
    Tool {
        result: ToolResult,
    },
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: content.into(),
            invocations: Vec::new(),
        }
    }

    pub fn assistant_with_invocations(
        content: impl Into<String>,
        invocations: Vec<ToolInvocation>,
    ) -> Self {
        Message::Assistant {
            content: content.into(),
            invocations,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn tool(result: ToolResult) -> Self {
        Message::Tool { result }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::Tool { .. } => Role::Tool,
        }
    }

    /// 文本内容；tool 消息没有文本，返回空串
    pub fn content(&self) -> &str {
        match self {
            Message::System { content }
            | Message::User { content }
            | Message::Assistant { content, .. } => content,
            Message::Tool { .. } => "",
        }
    }

    pub fn invocations(&self) -> &[ToolInvocation] {
        match self {
            Message::Assistant { invocations, .. } => invocations,
            _ => &[],
        }
    }

    pub fn result(&self) -> Option<&ToolResult> {
        match self {
            Message::Tool { result } => Some(result),
            _ => None,
        }
    }
}

/// 配对不变量被破坏的位置
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingViolation {
    #[error("invocation {0} has no result")]
    DanglingInvocation(String),

    #[error("result for {0} does not follow its invocation")]
    OrphanResult(String),

    #[error("expected result for {expected}, found {found}")]
    OutOfOrder { expected: String, found: String },
}

/// 校验配对不变量：每个调用后紧跟、按序、恰好一个引用其 id 的结果
pub fn check_pairing(messages: &[Message]) -> Result<(), PairingViolation> {
    let mut i = 0;
    while i < messages.len() {
        match &messages[i] {
            Message::Assistant { invocations, .. } => {
                for (offset, invocation) in invocations.iter().enumerate() {
                    match messages.get(i + 1 + offset) {
                        Some(Message::Tool { result }) if result.invocation_id == invocation.id => {}
                        Some(Message::Tool { result }) => {
                            return Err(PairingViolation::OutOfOrder {
                                expected: invocation.id.clone(),
                                found: result.invocation_id.clone(),
                            })
                        }
                        _ => {
                            return Err(PairingViolation::DanglingInvocation(
                                invocation.id.clone(),
                            ))
                        }
                    }
                }
                i += 1 + invocations.len();
            }
            Message::Tool { result } => {
                return Err(PairingViolation::OrphanResult(result.invocation_id.clone()))
            }
            _ => i += 1,
        }
    }
    Ok(())
}

/// 会话对话历史：回合内只追加，由当前回合独占修改
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_user_index(&self) -> Option<usize> {
        self.messages
            .iter()
            .rposition(|m| m.role() == Role::User)
    }

    pub fn check_pairing(&self) -> Result<(), PairingViolation> {
        check_pairing(&self.messages)
    }
}
