//! 回合过程事件：供调用方增量消费（CLI 打印、SSE 推送）
//!
//! 事件流也可由 TurnReport::replay 从已完成回合的对话重建；文本增量在重建时按消息合并。

use serde::Serialize;
use serde_json::Value;

use crate::memory::ToolResult;

/// 单个回合的过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    TurnStarted { turn_id: String },
    /// 路由选中子代理 profile（先于任何模型调用）
    DelegationNotice { profile: String, notice: String },
    TextDelta { text: String },
    ToolStarted {
        invocation_id: String,
        name: String,
        args: Value,
    },
    ToolFinished { result: ToolResult },
    /// notice: 非正常完成时的附加说明（如达到步数上限）
    TurnDone {
        final_text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        notice: Option<String>,
    },
    TurnError { kind: String, message: String },
    TurnCancelled,
}

impl TurnEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TurnEvent::TurnDone { .. } | TurnEvent::TurnError { .. } | TurnEvent::TurnCancelled
        )
    }
}

/// 合并相邻的 TextDelta，便于比较实时事件与重建事件
pub fn coalesce_text(events: &[TurnEvent]) -> Vec<TurnEvent> {
    let mut out: Vec<TurnEvent> = Vec::with_capacity(events.len());
    for event in events {
        if let TurnEvent::TextDelta { text } = event {
            if text.is_empty() {
                continue;
            }
            if let Some(TurnEvent::TextDelta { text: prev }) = out.last_mut() {
                prev.push_str(text);
                continue;
            }
        }
        out.push(event.clone());
    }
    out
}
