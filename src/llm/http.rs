//! HTTP 传输（reqwest + SSE）
//!
//! 流式请求把每个 SSE data 负载作为一个原始 chunk；非流式请求整个 body 作为唯一 chunk。
//! 非 2xx 响应连同 body 与 Retry-After 一起返回给适配器归类。

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{stream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};

use crate::llm::error::TransportError;
use crate::llm::stream::with_idle_timeout;
use crate::llm::traits::{EncodedRequest, RawStream, Transport};

/// 鉴权方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`（OpenAI 兼容）
    Bearer,
    /// `x-goog-api-key: <key>`（Gemini）
    GoogApiKey,
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    auth: AuthScheme,
    /// 建立连接并拿到响应头的超时
    request_timeout: Duration,
    /// 响应体两次数据之间的最长间隔
    idle_timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, auth: AuthScheme) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            auth,
            request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(90),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn network_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: EncodedRequest) -> Result<RawStream, TransportError> {
        let mut builder = self.client.post(self.url(&request.path)).json(&request.body);
        builder = match self.auth {
            AuthScheme::Bearer => builder.bearer_auth(&self.api_key),
            AuthScheme::GoogApiKey => builder.header("x-goog-api-key", &self.api_key),
        };

        let response = tokio::time::timeout(self.request_timeout, builder.send())
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = status.as_u16(), body = %body, "provider returned error status");
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }

        if request.stream {
            let events = response.bytes_stream().eventsource().map(|item| match item {
                Ok(event) => Ok(event.data),
                Err(e) => Err(TransportError::Network(format!("SSE stream error: {e}"))),
            });
            Ok(with_idle_timeout(Box::pin(events), self.idle_timeout))
        } else {
            let body = tokio::time::timeout(self.idle_timeout, response.text())
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(network_error)?;
            Ok(Box::pin(stream::once(async move { Ok(body) })))
        }
    }
}
