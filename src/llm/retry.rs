//! 重试控制器
//!
//! 对一次模型调用的建立阶段做指数退避重试：可重试错误（限流、网络、超时、5xx）按
//! base * 2^attempt + jitter 等待后重试，单个模型达到 max_attempts 后换下一个备用模型；
//! 不可重试错误立即终止。流一旦产出第一个非错误事件即视为建立成功，之后的错误不再重试。

use std::future::Future;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use rand::Rng;
use tracing::{info, warn};

use crate::core::AgentError;
use crate::llm::error::ProviderError;
use crate::llm::traits::{ProviderEvent, ProviderEventStream};

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// 每个模型的最大尝试次数（含首次）
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待（attempt 从 0 开始），jitter 取值 [0, base)
    pub fn delay_for(&self, attempt: u32, jitter: Duration) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        exp.saturating_add(jitter).min(self.max_delay)
    }

    /// 带随机抖动的退避；服务端给出 Retry-After 时不短于它（仍受 max_delay 限制）
    pub fn backoff(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..base_ms))
        };
        let delay = self.delay_for(attempt, jitter);
        match retry_after {
            Some(hint) => delay.max(hint).min(self.max_delay),
            None => delay,
        }
    }
}

/// 已建立的模型流
pub struct Established {
    /// 实际应答的模型
    pub model: String,
    /// 总尝试次数（跨模型）
    pub attempts: u32,
    pub stream: ProviderEventStream,
}

impl std::fmt::Debug for Established {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Established")
            .field("model", &self.model)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// 依次尝试 models；op 接收模型名，返回已解码的事件流或建立阶段的错误
    pub async fn call<F, Fut>(&self, models: &[String], mut op: F) -> Result<Established, AgentError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<ProviderEventStream, ProviderError>>,
    {
        if models.is_empty() {
            return Err(AgentError::RoutingConfig("no model configured".into()));
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut total = 0u32;
        let mut last_error: Option<ProviderError> = None;

        for (index, model) in models.iter().enumerate() {
            if index > 0 {
                info!(model = %model, "falling back to next model");
            }
            for attempt in 0..max_attempts {
                total += 1;
                let error = match op(model.clone()).await {
                    Ok(stream) => match peek(stream).await {
                        Ok(stream) => {
                            return Ok(Established {
                                model: model.clone(),
                                attempts: total,
                                stream,
                            })
                        }
                        Err(e) => e,
                    },
                    Err(e) => e,
                };

                if !error.is_retryable() {
                    warn!(model = %model, kind = %error.kind, error = %error.message, "non-retryable provider error");
                    return Err(AgentError::ProviderFatal(error.to_string()));
                }

                let transient = AgentError::ProviderRetryable(error.to_string());
                if attempt + 1 < max_attempts {
                    let delay = self.policy.backoff(attempt, error.retry_after);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        model = %model,
                        error = %transient,
                        "provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    warn!(model = %model, attempts = max_attempts, error = %transient, "retries exhausted for model");
                }
                last_error = Some(error);
            }
        }

        let reason = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".into());
        Err(AgentError::ProviderFatal(format!(
            "gave up after {total} attempts: {reason}"
        )))
    }
}

/// 读取首个事件：若为错误则视为建立失败，否则把它放回流头
async fn peek(mut events: ProviderEventStream) -> Result<ProviderEventStream, ProviderError> {
    match events.next().await {
        Some(ProviderEvent::Error(e)) => Err(e),
        Some(first) => Ok(Box::pin(stream::once(async move { first }).chain(events))),
        None => Ok(events),
    }
}
