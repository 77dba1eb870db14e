//! 原始 chunk 流 -> ProviderEvent 流
//!
//! 按需拉取原始 chunk 交给解码器；原始流结束时调用一次 finish；
//! 遇到 completion 或 error 即结束，之后的事件丢弃。

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::{stream, StreamExt};

use crate::llm::error::TransportError;
use crate::llm::traits::{ProviderEvent, ProviderEventStream, RawStream, StreamDecoder};

struct DecodeState {
    raw: RawStream,
    decoder: Box<dyn StreamDecoder>,
    pending: VecDeque<ProviderEvent>,
    raw_done: bool,
    done: bool,
}

pub fn decode(decoder: Box<dyn StreamDecoder>, raw: RawStream) -> ProviderEventStream {
    let state = DecodeState {
        raw,
        decoder,
        pending: VecDeque::new(),
        raw_done: false,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut st| async move {
        loop {
            if st.done {
                return None;
            }
            if let Some(event) = st.pending.pop_front() {
                if event.is_terminal() {
                    st.done = true;
                    st.pending.clear();
                }
                return Some((event, st));
            }
            if st.raw_done {
                return None;
            }
            match st.raw.next().await {
                Some(Ok(chunk)) => {
                    let events = st.decoder.decode_chunk(&chunk);
                    st.pending.extend(events);
                }
                Some(Err(err)) => {
                    let error = st.decoder.decode_error(&err);
                    st.pending.push_back(ProviderEvent::Error(error));
                }
                None => {
                    st.raw_done = true;
                    let events = st.decoder.finish();
                    st.pending.extend(events);
                }
            }
        }
    }))
}

/// 相邻两个 chunk 之间超过 idle 未到达时产出 Timeout 并结束
pub fn with_idle_timeout(raw: RawStream, idle: Duration) -> RawStream {
    Box::pin(stream::unfold(Some(raw), move |state| async move {
        let mut raw = state?;
        match tokio::time::timeout(idle, raw.next()).await {
            Ok(Some(item)) => Some((item, Some(raw))),
            Ok(None) => None,
            Err(_) => {
                tracing::warn!(idle_secs = idle.as_secs_f64(), "stream stalled, no chunk within idle timeout");
                Some((Err(TransportError::Timeout), None))
            }
        }
    }))
}
