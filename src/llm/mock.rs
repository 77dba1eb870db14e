//! 脚本化传输（用于测试，无需 API）
//!
//! 按顺序为每次 send 返回预先写好的应答：一组原始 chunk、一个传输错误，或永不结束的流。
//! 记录收到的每个请求，便于断言编码结果。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::error::TransportError;
use crate::llm::traits::{EncodedRequest, RawStream, Transport};

/// 单次调用的应答
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// 逐个产出的原始 chunk（之后流结束）
    Chunks(Vec<String>),
    /// 建立阶段即失败
    Fail(TransportError),
    /// 产出 chunk 后在流中途报错
    ChunksThenFail(Vec<String>, TransportError),
    /// 产出 chunk 后挂起，不再结束
    Hang(Vec<String>),
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<EncodedRequest>>,
}

impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reply);
    }

    /// 已收到的请求（按顺序）
    pub fn requests(&self) -> Vec<EncodedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: EncodedRequest) -> Result<RawStream, TransportError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        match reply {
            None => Err(TransportError::Network("script exhausted".into())),
            Some(ScriptedReply::Fail(err)) => Err(err),
            Some(ScriptedReply::Chunks(chunks)) => {
                Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
            }
            Some(ScriptedReply::ChunksThenFail(chunks, err)) => {
                let items: Vec<Result<String, TransportError>> = chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(err)))
                    .collect();
                Ok(Box::pin(stream::iter(items)))
            }
            Some(ScriptedReply::Hang(chunks)) => {
                let head = stream::iter(chunks.into_iter().map(Ok));
                Ok(Box::pin(futures_util::StreamExt::chain(head, stream::pending())))
            }
        }
    }
}

/// 常用 chunk 序列
pub mod script {
    use serde_json::{json, Value};

    /// OpenAI 兼容：逐段文本 + stop
    pub fn openai_text(pieces: &[&str]) -> Vec<String> {
        let mut chunks: Vec<String> = pieces
            .iter()
            .map(|p| json!({"choices": [{"index": 0, "delta": {"content": p}}]}).to_string())
            .collect();
        chunks.push(
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}).to_string(),
        );
        chunks.push("[DONE]".into());
        chunks
    }

    /// OpenAI 兼容：一组工具调用（id, name, args），参数按两段分片下发
    pub fn openai_tool_calls(calls: &[(&str, &str, Value)]) -> Vec<String> {
        let mut chunks = Vec::new();
        for (index, (id, name, args)) in calls.iter().enumerate() {
            let raw = args.to_string();
            let (head, tail) = raw.split_at(raw.len() / 2);
            chunks.push(
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                    "index": index, "id": id, "type": "function",
                    "function": {"name": name, "arguments": head}
                }]}}]})
                .to_string(),
            );
            chunks.push(
                json!({"choices": [{"index": 0, "delta": {"tool_calls": [{
                    "index": index, "function": {"arguments": tail}
                }]}}]})
                .to_string(),
            );
        }
        chunks.push(
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]})
                .to_string(),
        );
        chunks.push("[DONE]".into());
        chunks
    }

    /// Gemini：逐段文本，最后一段带 finishReason
    pub fn gemini_text(pieces: &[&str]) -> Vec<String> {
        let last = pieces.len().saturating_sub(1);
        pieces
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut candidate = json!({"content": {"role": "model", "parts": [{"text": p}]}});
                if i == last {
                    candidate["finishReason"] = json!("STOP");
                }
                json!({"candidates": [candidate]}).to_string()
            })
            .collect()
    }

    /// Gemini：一个 chunk 内的多个 functionCall
    pub fn gemini_tool_calls(calls: &[(&str, &str, Value)]) -> Vec<String> {
        let parts: Vec<Value> = calls
            .iter()
            .map(|(id, name, args)| json!({"functionCall": {"id": id, "name": name, "args": args}}))
            .collect();
        vec![json!({"candidates": [{
            "content": {"role": "model", "parts": parts},
            "finishReason": "STOP"
        }]})
        .to_string()]
    }
}
