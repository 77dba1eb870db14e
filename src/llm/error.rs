//! Provider 错误归类
//!
//! 传输层只报告原始错误（HTTP 状态 + body、网络、超时）；各协议适配器的 decode_error
//! 在此基础上结合 body 中的错误码归类为 ErrorKind，RetryController 据此决定重试或终止。

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    Network,
    Timeout,
    Server,
    Auth,
    InvalidRequest,
    /// 配额永久耗尽（需充值），不重试
    QuotaExhausted,
    /// 响应无法解析
    Decode,
}

impl ErrorKind {
    /// 限流、网络、超时、5xx 可重试；鉴权、请求错误、配额耗尽直接失败
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Server
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Server => "server",
            ErrorKind::Auth => "auth",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::Decode => "decode",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 归一化后的 Provider 错误
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    pub status: Option<u16>,
    /// 服务端给出的重试提示（Retry-After）
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// 传输层原始错误（尚未按协议归类）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("HTTP {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,
}

/// 仅按 HTTP 状态码的通用归类
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        429 => ErrorKind::RateLimited,
        401 | 403 => ErrorKind::Auth,
        408 => ErrorKind::Timeout,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::InvalidRequest,
    }
}

/// 从错误 body 中取人类可读的 message（`{"error": {"message": ...}}`），取不到则返回原文
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// 通用转换：refine 根据状态码与错误 body 细化类别（返回 None 时按状态码归类）
pub fn from_transport(
    err: &TransportError,
    refine: impl Fn(u16, &Value) -> Option<ErrorKind>,
) -> ProviderError {
    match err {
        TransportError::Status {
            status,
            body,
            retry_after,
        } => {
            let parsed = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
            let kind = refine(*status, &parsed).unwrap_or_else(|| classify_status(*status));
            ProviderError::new(kind, error_message(body))
                .with_status(*status)
                .with_retry_after(*retry_after)
        }
        TransportError::Network(message) => ProviderError::new(ErrorKind::Network, message.clone()),
        TransportError::Timeout => ProviderError::new(ErrorKind::Timeout, "request timed out"),
    }
}
