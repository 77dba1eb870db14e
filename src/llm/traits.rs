//! Provider 抽象
//!
//! 每种协议族实现一个 ProviderAdapter：encode_request（归一化请求 -> 协议请求体）、
//! decode_stream（原始流 -> ProviderEvent 流）、decode_error（传输错误 -> ErrorKind）。
//! Transport 只负责把请求发出去并返回原始 chunk 流，编排器从不直接接触协议格式。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;

use crate::llm::error::{ProviderError, TransportError};
use crate::memory::{Message, ToolInvocation};
use crate::tools::ToolSchema;

/// 原始 chunk 流：SSE 的每个 data 负载，或非流式响应的完整 body
pub type RawStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// 归一化事件流（惰性、有限、不可重启）
pub type ProviderEventStream = Pin<Box<dyn Stream<Item = ProviderEvent> + Send>>;

/// 协议族
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    /// functionCall / functionResponse 结构化 part
    Gemini,
    /// tool_calls 数组，参数为 JSON 字符串
    OpenAiCompat,
}

/// 单次调用的 token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// 归一化的 Provider 事件
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    InvocationRequest(ToolInvocation),
    Completion {
        finish_reason: Option<String>,
        usage: Option<TokenUsage>,
    },
    Error(ProviderError),
}

impl ProviderEvent {
    /// completion / error 之后不再有事件
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProviderEvent::Completion { .. } | ProviderEvent::Error(_))
    }
}

/// 归一化请求
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub messages: &'a [Message],
    /// 当前生效的系统指令（默认或子代理 profile）
    pub system: &'a str,
    pub tools: &'a [ToolSchema],
    pub model: &'a str,
    pub stream: bool,
}

/// 编码后的协议请求：相对 base_url 的路径 + JSON 请求体
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRequest {
    pub path: String,
    pub body: Value,
    pub stream: bool,
}

/// 流解码器：单次调用内有状态（累积分片、缓冲标记文本）
pub trait StreamDecoder: Send {
    /// 处理一个原始 chunk，返回由它产生的事件（通常 0 或 1 个）
    fn decode_chunk(&mut self, chunk: &str) -> Vec<ProviderEvent>;

    /// 流中途的传输错误
    fn decode_error(&self, err: &TransportError) -> ProviderError;

    /// 原始流结束时调用一次：补发剩余事件与 completion
    fn finish(&mut self) -> Vec<ProviderEvent>;
}

/// 协议适配器
pub trait ProviderAdapter: Send + Sync {
    fn family(&self) -> ProviderFamily;

    fn encode_request(&self, request: &ModelRequest<'_>) -> EncodedRequest;

    /// 每次调用新建一个解码器
    fn decoder(&self) -> Box<dyn StreamDecoder>;

    fn decode_error(&self, err: &TransportError) -> ProviderError;

    fn decode_stream(&self, raw: RawStream) -> ProviderEventStream {
        crate::llm::stream::decode(self.decoder(), raw)
    }
}

/// Provider 传输：由外部 HTTP/流式客户端提供
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: EncodedRequest) -> Result<RawStream, TransportError>;
}
