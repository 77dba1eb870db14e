//! Gemini 协议适配器
//!
//! 工具调用是 content.parts 中的 functionCall（参数为结构化对象），结果以 user 角色的
//! functionResponse part 回传；同一角色的相邻消息合并到一个 content 中。
//! 每个 chunk 携带完整的调用，不需要分片累积，也没有内联标记回退。

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::llm::error::{from_transport, ErrorKind, ProviderError, TransportError};
use crate::llm::traits::{
    EncodedRequest, ModelRequest, ProviderAdapter, ProviderEvent, ProviderFamily, StreamDecoder,
    TokenUsage,
};
use crate::memory::{Message, ToolInvocation};

/// Gemini 接受的 schema 关键字
const SCHEMA_KEYS: &[&str] = &["type", "description", "properties", "required", "items", "enum", "nullable"];

#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    max_output_tokens: u32,
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self {
            max_output_tokens: 8192,
        }
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.max_output_tokens = max;
        self
    }
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// 只保留 Gemini 支持的关键字；`type: ["string", "null"]` 转为 `type: string, nullable: true`
pub fn clean_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };
    let mut out = Map::new();

    for (key, value) in obj {
        if !SCHEMA_KEYS.contains(&key.as_str()) {
            continue;
        }
        let cleaned = match key.as_str() {
            "properties" => match value.as_object() {
                Some(props) => Value::Object(
                    props
                        .iter()
                        .map(|(name, prop)| (name.clone(), clean_schema(prop)))
                        .collect(),
                ),
                None => continue,
            },
            "items" => clean_schema(value),
            "type" => match value {
                Value::Array(types) => {
                    if types.iter().any(|t| t == "null") {
                        out.insert("nullable".into(), Value::Bool(true));
                    }
                    types
                        .iter()
                        .find(|t| *t != "null")
                        .cloned()
                        .unwrap_or_else(|| json!("string"))
                }
                other => other.clone(),
            },
            _ => value.clone(),
        };
        out.insert(key.clone(), cleaned);
    }
    Value::Object(out)
}

/// 相邻同角色合并为一个 content
fn push_part(contents: &mut Vec<Value>, role: &str, part: Value) {
    if let Some(last) = contents.last_mut() {
        if last["role"] == role {
            if let Some(parts) = last["parts"].as_array_mut() {
                parts.push(part);
                return;
            }
        }
    }
    contents.push(json!({"role": role, "parts": [part]}));
}

fn args_object(arguments: &Value) -> Value {
    match arguments {
        Value::Object(_) => arguments.clone(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(v @ Value::Object(_)) => v,
            _ => json!({}),
        },
        _ => json!({}),
    }
}

fn encode_contents(messages: &[Message]) -> Vec<Value> {
    let mut contents = Vec::new();
    // functionResponse 需要带函数名：按 id 查回前面的调用
    let mut names: HashMap<&str, &str> = HashMap::new();

    for message in messages {
        match message {
            Message::User { content } | Message::System { content } => {
                push_part(&mut contents, "user", json!({"text": content}));
            }
            Message::Assistant {
                content,
                invocations,
            } => {
                if !content.is_empty() {
                    push_part(&mut contents, "model", json!({"text": content}));
                }
                for inv in invocations {
                    names.insert(inv.id.as_str(), inv.tool_name.as_str());
                    push_part(
                        &mut contents,
                        "model",
                        json!({"functionCall": {
                            "id": inv.id,
                            "name": inv.tool_name,
                            "args": args_object(&inv.arguments),
                        }}),
                    );
                }
            }
            Message::Tool { result } => {
                let name = names
                    .get(result.invocation_id.as_str())
                    .copied()
                    .unwrap_or_default();
                let response = if result.is_ok() {
                    json!({"output": result.payload})
                } else {
                    json!({"error": result.model_text()})
                };
                push_part(
                    &mut contents,
                    "user",
                    json!({"functionResponse": {
                        "id": result.invocation_id,
                        "name": name,
                        "response": response,
                    }}),
                );
            }
        }
    }
    contents
}

impl ProviderAdapter for GeminiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    fn encode_request(&self, request: &ModelRequest<'_>) -> EncodedRequest {
        let mut body = json!({
            "contents": encode_contents(request.messages),
            "generationConfig": {"maxOutputTokens": self.max_output_tokens},
        });
        if !request.system.is_empty() {
            body["systemInstruction"] = json!({"parts": [{"text": request.system}]});
        }
        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": clean_schema(&t.parameters),
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        let path = if request.stream {
            format!("models/{}:streamGenerateContent?alt=sse", request.model)
        } else {
            format!("models/{}:generateContent", request.model)
        };
        EncodedRequest {
            path,
            body,
            stream: request.stream,
        }
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GeminiDecoder::default())
    }

    fn decode_error(&self, err: &TransportError) -> ProviderError {
        from_transport(err, refine_error)
    }
}

fn refine_error(status: u16, body: &Value) -> Option<ErrorKind> {
    let error = body.get("error")?;
    let message = error
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_lowercase();
    let state = error.get("status").and_then(|s| s.as_str()).unwrap_or_default();

    if message.contains("api key not valid") || state == "UNAUTHENTICATED" || state == "PERMISSION_DENIED" {
        return Some(ErrorKind::Auth);
    }
    if state == "RESOURCE_EXHAUSTED" || status == 429 {
        // 需要开通计费的配额不会自行恢复
        if message.contains("billing") {
            return Some(ErrorKind::QuotaExhausted);
        }
        return Some(ErrorKind::RateLimited);
    }
    if state == "UNAVAILABLE" || state == "INTERNAL" {
        return Some(ErrorKind::Server);
    }
    None
}

fn parse_usage(value: &Value) -> Option<TokenUsage> {
    let prompt = value.get("promptTokenCount").and_then(|v| v.as_u64()).unwrap_or(0);
    let completion = value
        .get("candidatesTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let total = value
        .get("totalTokenCount")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt + completion);
    Some(TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: total,
    })
}

/// Gemini 流解码器
#[derive(Debug, Default)]
pub struct GeminiDecoder {
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
    completed: bool,
}

impl GeminiDecoder {
    fn decode_response(&mut self, value: &Value, events: &mut Vec<ProviderEvent>) {
        if let Some(error) = value.get("error") {
            let kind = refine_error(0, &json!({ "error": error })).unwrap_or(ErrorKind::Server);
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("provider returned an error");
            events.push(ProviderEvent::Error(ProviderError::new(kind, message)));
            return;
        }
        if let Some(reason) = value
            .get("promptFeedback")
            .and_then(|f| f.get("blockReason"))
            .and_then(|r| r.as_str())
        {
            events.push(ProviderEvent::Error(ProviderError::new(
                ErrorKind::InvalidRequest,
                format!("prompt blocked: {reason}"),
            )));
            return;
        }
        if let Some(usage) = value.get("usageMetadata").and_then(parse_usage) {
            self.usage = Some(usage);
        }

        let Some(candidate) = value
            .get("candidates")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
        else {
            return;
        };

        let parts = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array());
        for part in parts.into_iter().flatten() {
            if part.get("thought").and_then(|t| t.as_bool()) == Some(true) {
                continue;
            }
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                if !text.is_empty() {
                    events.push(ProviderEvent::TextDelta(text.to_string()));
                }
            }
            if let Some(call) = part.get("functionCall") {
                let name = call
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                let id = call
                    .get("id")
                    .and_then(|i| i.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{name}-{}", uuid::Uuid::new_v4().simple()));
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                events.push(ProviderEvent::InvocationRequest(ToolInvocation::new(
                    id, name, args,
                )));
            }
        }

        if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
            self.finish_reason = Some(reason.to_string());
        }
    }
}

impl StreamDecoder for GeminiDecoder {
    fn decode_chunk(&mut self, chunk: &str) -> Vec<ProviderEvent> {
        let chunk = chunk.trim();
        if chunk.is_empty() || self.completed {
            return Vec::new();
        }
        let value: Value = match serde_json::from_str(chunk) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed chunk");
                return Vec::new();
            }
        };

        let mut events = Vec::new();
        match &value {
            // 非 SSE 的 streamGenerateContent 返回整个数组
            Value::Array(items) => {
                for item in items {
                    self.decode_response(item, &mut events);
                }
            }
            other => self.decode_response(other, &mut events),
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
        self.completed = true;
        if self.finish_reason.is_none() {
            return vec![ProviderEvent::Error(ProviderError::new(
                ErrorKind::Network,
                "stream closed before finishReason",
            ))];
        }
        vec![ProviderEvent::Completion {
            finish_reason: self.finish_reason.clone(),
            usage: self.usage,
        }]
    }
}
