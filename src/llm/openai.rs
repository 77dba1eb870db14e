//! OpenAI 兼容协议适配器（OpenAI / Kimi / DeepSeek 等 chat/completions 端点）
//!
//! 工具调用走 `tool_calls` 数组，参数是 JSON 字符串：流式时按 index 累积 id/name/arguments 分片，
//! 完成时再解析参数串。若结构化字段缺失，则从正文中的 Kimi 内联标记恢复调用。

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::llm::error::{from_transport, ErrorKind, ProviderError, TransportError};
use crate::llm::markers::{parse_arguments, MarkerScanner};
use crate::llm::traits::{
    EncodedRequest, ModelRequest, ProviderAdapter, ProviderEvent, ProviderFamily, StreamDecoder,
    TokenUsage,
};
use crate::memory::{Message, ToolInvocation};

/// OpenAI 兼容适配器
#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    max_output_tokens: Option<u32>,
    /// 流式请求附带 stream_options.include_usage（OpenAI、DeepSeek 需要；Kimi 在 choice 内返回 usage）
    stream_usage: bool,
}

impl OpenAiCompatAdapter {
    pub fn new() -> Self {
        Self {
            max_output_tokens: None,
            stream_usage: false,
        }
    }

    pub fn with_stream_usage(mut self, enabled: bool) -> Self {
        self.stream_usage = enabled;
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = Some(max);
        self
    }
}

impl Default for OpenAiCompatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// 参数在协议中是字符串：未能解析的原文原样带回
fn encode_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

fn encode_messages(system: &str, messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system.is_empty() {
        out.push(json!({"role": "system", "content": system}));
    }

    for message in messages {
        let encoded = match message {
            Message::System { content } => json!({"role": "system", "content": content}),
            Message::User { content } => json!({"role": "user", "content": content}),
            Message::Assistant {
                content,
                invocations,
            } if invocations.is_empty() => json!({"role": "assistant", "content": content}),
            Message::Assistant {
                content,
                invocations,
            } => {
                let tool_calls: Vec<Value> = invocations
                    .iter()
                    .map(|inv| {
                        json!({
                            "id": inv.id,
                            "type": "function",
                            "function": {
                                "name": inv.tool_name,
                                "arguments": encode_arguments(&inv.arguments),
                            }
                        })
                    })
                    .collect();
                let content = if content.is_empty() {
                    Value::Null
                } else {
                    Value::String(content.clone())
                };
                json!({"role": "assistant", "content": content, "tool_calls": tool_calls})
            }
            Message::Tool { result } => json!({
                "role": "tool",
                "tool_call_id": result.invocation_id,
                "content": result.model_text(),
            }),
        };
        out.push(encoded);
    }
    out
}

impl ProviderAdapter for OpenAiCompatAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAiCompat
    }

    fn encode_request(&self, request: &ModelRequest<'_>) -> EncodedRequest {
        let mut body = json!({
            "model": request.model,
            "messages": encode_messages(request.system, request.messages),
            "stream": request.stream,
        });

        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    let mut parameters = t.parameters.clone();
                    if let Some(obj) = parameters.as_object_mut() {
                        obj.remove("$schema");
                        obj.remove("title");
                    }
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["tool_choice"] = json!("auto");
        }
        if let Some(max) = self.max_output_tokens {
            body["max_tokens"] = json!(max);
        }
        if request.stream && self.stream_usage {
            body["stream_options"] = json!({"include_usage": true});
        }

        EncodedRequest {
            path: "chat/completions".to_string(),
            body,
            stream: request.stream,
        }
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiDecoder::new(true))
    }

    fn decode_error(&self, err: &TransportError) -> ProviderError {
        from_transport(err, refine_error)
    }
}

/// 根据 body 中的 error.code / error.type 细化类别
fn refine_error(status: u16, body: &Value) -> Option<ErrorKind> {
    let error = body.get("error")?;
    let code = error
        .get("code")
        .and_then(|c| c.as_str())
        .or_else(|| error.get("type").and_then(|t| t.as_str()))
        .unwrap_or_default();

    match code {
        "insufficient_quota" | "exceeded_current_quota_error" | "billing_hard_limit_reached" => {
            Some(ErrorKind::QuotaExhausted)
        }
        "invalid_api_key" | "invalid_authentication_error" => Some(ErrorKind::Auth),
        "rate_limit_exceeded" | "rate_limit_reached_error" | "engine_overloaded_error" => {
            Some(ErrorKind::RateLimited)
        }
        "server_error" if status < 500 => Some(ErrorKind::Server),
        _ => None,
    }
}

/// 流内错误（`{"error": {...}}` chunk）
fn chunk_error(error: &Value) -> ProviderError {
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("provider returned an error")
        .to_string();
    let kind = refine_error(0, &json!({ "error": error })).unwrap_or(ErrorKind::Server);
    ProviderError::new(kind, message)
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let prompt = value.get("prompt_tokens")?.as_u64()?;
    let completion = value
        .get("completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total = value
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt + completion);
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

/// 按 index 累积中的调用
#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// OpenAI 兼容流解码器
pub struct OpenAiDecoder {
    calls: BTreeMap<u64, PartialCall>,
    scanner: Option<MarkerScanner>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    completed: bool,
}

impl OpenAiDecoder {
    pub fn new(inline_markers: bool) -> Self {
        Self {
            calls: BTreeMap::new(),
            scanner: inline_markers.then(MarkerScanner::new),
            finish_reason: None,
            usage: None,
            completed: false,
        }
    }

    fn push_text(&mut self, text: &str, events: &mut Vec<ProviderEvent>) {
        let visible = match self.scanner.as_mut() {
            Some(scanner) => scanner.push(text),
            None => text.to_string(),
        };
        if !visible.is_empty() {
            events.push(ProviderEvent::TextDelta(visible));
        }
    }

    fn accumulate_calls(&mut self, tool_calls: &[Value]) {
        for (position, call) in tool_calls.iter().enumerate() {
            let index = call
                .get("index")
                .and_then(|i| i.as_u64())
                .unwrap_or(position as u64);
            let entry = self.calls.entry(index).or_default();

            if let Some(id) = call.get("id").and_then(|v| v.as_str()) {
                if !id.is_empty() {
                    entry.id = Some(id.to_string());
                }
            }
            let Some(function) = call.get("function") else {
                continue;
            };
            if let Some(name) = function.get("name").and_then(|v| v.as_str()) {
                if entry.name.is_empty() {
                    entry.name = name.to_string();
                }
            }
            match function.get("arguments") {
                Some(Value::String(fragment)) => entry.arguments.push_str(fragment),
                Some(Value::Null) | None => {}
                Some(other) => entry.arguments.push_str(&other.to_string()),
            }
        }
    }

    fn complete(&mut self) -> Vec<ProviderEvent> {
        if self.completed {
            return Vec::new();
        }
        self.completed = true;
        let mut events = Vec::new();

        let mut recovered = Vec::new();
        if let Some(scanner) = self.scanner.as_mut() {
            let tail = scanner.finish();
            if !tail.is_empty() {
                events.push(ProviderEvent::TextDelta(tail));
            }
            recovered = scanner.take_invocations();
        }

        let structured: Vec<ToolInvocation> = std::mem::take(&mut self.calls)
            .into_values()
            .map(|call| {
                let id = call
                    .id
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
                ToolInvocation::new(id, call.name, parse_arguments(&call.arguments))
            })
            .collect();

        let invocations = if structured.is_empty() {
            if !recovered.is_empty() {
                tracing::debug!(
                    count = recovered.len(),
                    finish_reason = ?self.finish_reason,
                    "recovered tool calls from inline markers"
                );
            } else if self.finish_reason.as_deref() == Some("tool_calls") {
                tracing::warn!("finish_reason=tool_calls but no tool call could be recovered");
            }
            recovered
        } else {
            structured
        };

        events.extend(invocations.into_iter().map(ProviderEvent::InvocationRequest));
        events.push(ProviderEvent::Completion {
            finish_reason: self.finish_reason.clone(),
            usage: self.usage,
        });
        events
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn decode_chunk(&mut self, chunk: &str) -> Vec<ProviderEvent> {
        let chunk = chunk.trim();
        if chunk.is_empty() || self.completed {
            return Vec::new();
        }
        if chunk == "[DONE]" {
            return self.complete();
        }

        let value: Value = match serde_json::from_str(chunk) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed chunk");
                return Vec::new();
            }
        };
        if let Some(error) = value.get("error") {
            return vec![ProviderEvent::Error(chunk_error(error))];
        }

        let mut events = Vec::new();
        if let Some(usage) = value.get("usage").and_then(parse_usage) {
            self.usage = Some(usage);
        }

        let choices = value
            .get("choices")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default();
        for choice in &choices {
            // 流式为 delta，非流式为 message
            if let Some(delta) = choice.get("delta").or_else(|| choice.get("message")) {
                if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                    self.push_text(text, &mut events);
                }
                if let Some(tool_calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
                    self.accumulate_calls(tool_calls);
                }
            }
            // Moonshot 把 usage 放在 choice 内
            if let Some(usage) = choice.get("usage").and_then(parse_usage) {
                self.usage = Some(usage);
            }
            if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                self.finish_reason = Some(reason.to_string());
            }
        }

        events
    }

    fn decode_error(&self, err: &TransportError) -> ProviderError {
        from_transport(err, refine_error)
    }

    fn finish(&mut self) -> Vec<ProviderEvent> {
        if self.completed {
            return Vec::new();
        }
        if self.finish_reason.is_some() {
            return self.complete();
        }
        vec![ProviderEvent::Error(ProviderError::new(
            ErrorKind::Network,
            "stream closed before finish_reason",
        ))]
    }
}
