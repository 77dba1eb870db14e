//! Token 预算控制
//!
//! 估算消息列表的 token 数；超出上限时按「完整交换」（一条 user 消息及其后的 assistant/tool 消息）
//! 从最旧开始丢弃或摘要；较早的交换都丢完仍超限时，再丢当前交换里最旧的「步骤」
//! （一条 assistant 消息及其 tool 结果），最新一步保留。不拆开调用与结果的配对，也不丢掉最后一条 user 消息。

use std::ops::Range;

use serde::Deserialize;

use crate::core::AgentError;
use crate::memory::{Message, Role};

/// 每条消息的固定开销（角色、分隔符等）
const MESSAGE_OVERHEAD: usize = 4;
/// 每个工具调用的固定开销（id、类型字段等）
const INVOCATION_OVERHEAD: usize = 8;
/// 摘要中引用的首条请求最大字符数
const SUMMARY_QUOTE_CHARS: usize = 80;

/// Token 估算器（简单的字符计数近似）
pub struct TokenEstimator;

impl TokenEstimator {
    /// 估算文本的 token 数量
    /// 使用简单的启发式规则：英文约 4 字符/token，中文约 1.5 字符/token
    pub fn estimate(text: &str) -> usize {
        let mut ascii_chars = 0;
        let mut non_ascii_chars = 0;

        for c in text.chars() {
            if c.is_ascii() {
                ascii_chars += 1;
            } else {
                non_ascii_chars += 1;
            }
        }

        let tokens = ascii_chars / 4 + (non_ascii_chars as f64 / 1.5).ceil() as usize;
        tokens.max(1)
    }

    /// 单条消息：正文 + 调用名与参数 / 结果 payload + 固定开销
    pub fn estimate_message(message: &Message) -> usize {
        let body = match message {
            Message::System { content } | Message::User { content } => Self::estimate(content),
            Message::Assistant {
                content,
                invocations,
            } => {
                Self::estimate(content)
                    + invocations
                        .iter()
                        .map(|inv| {
                            INVOCATION_OVERHEAD
                                + Self::estimate(&inv.tool_name)
                                + Self::estimate(&inv.arguments.to_string())
                        })
                        .sum::<usize>()
            }
            Message::Tool { result } => {
                Self::estimate(&result.invocation_id) + Self::estimate(&result.model_text())
            }
        };
        MESSAGE_OVERHEAD + body
    }

    pub fn estimate_messages(messages: &[Message]) -> usize {
        messages.iter().map(Self::estimate_message).sum()
    }
}

/// 压缩策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionStrategy {
    /// 直接丢弃最旧的交换
    #[default]
    Truncate,
    /// 丢弃并用一条 system 摘要替代
    Summarize,
}

/// 压缩结果
#[derive(Debug, Clone)]
pub struct Compressed {
    pub messages: Vec<Message>,
    /// 被丢弃（或摘要）的单元数：较早的交换加上当前交换内的步骤
    pub dropped_exchanges: usize,
    pub estimate: usize,
}

/// Token 预算管理器：上限 + 压缩策略
#[derive(Debug, Clone)]
pub struct TokenBudget {
    ceiling: usize,
    strategy: CompressionStrategy,
}

impl TokenBudget {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            strategy: CompressionStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: CompressionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn strategy(&self) -> CompressionStrategy {
        self.strategy
    }

    pub fn estimate(&self, messages: &[Message]) -> usize {
        TokenEstimator::estimate_messages(messages)
    }

    /// 请求中固定部分（系统指令、工具声明）之外留给消息的额度
    pub fn message_ceiling(&self, fixed_overhead: usize) -> usize {
        self.ceiling.saturating_sub(fixed_overhead)
    }

    /// 将消息压到 ceiling 以内；不拆配对、不丢最后一条 user 消息，做不到则返回 BudgetExceeded
    pub fn compress(&self, messages: &[Message], ceiling: usize) -> Result<Compressed, AgentError> {
        let total = self.estimate(messages);
        if total <= ceiling {
            return Ok(Compressed {
                messages: messages.to_vec(),
                dropped_exchanges: 0,
                estimate: total,
            });
        }

        let units = droppable_units(messages);
        let mut remaining = total;

        for dropped in 1..=units.len() {
            remaining -= self.estimate(&messages[units[dropped - 1].clone()]);
            let removed = &units[..dropped];
            let kept = retain_outside(messages, removed);

            if self.strategy == CompressionStrategy::Summarize {
                let gone: Vec<Message> = removed
                    .iter()
                    .flat_map(|r| messages[r.clone()].iter().cloned())
                    .collect();
                let summary = summarize(&gone, dropped);
                let with_summary = remaining + TokenEstimator::estimate_message(&summary);
                if with_summary <= ceiling {
                    let mut out = Vec::with_capacity(kept.len() + 1);
                    out.push(summary);
                    out.extend(kept);
                    return Ok(Compressed {
                        messages: out,
                        dropped_exchanges: dropped,
                        estimate: with_summary,
                    });
                }
            }

            if remaining <= ceiling {
                return Ok(Compressed {
                    messages: kept,
                    dropped_exchanges: dropped,
                    estimate: remaining,
                });
            }
        }

        Err(AgentError::BudgetExceeded {
            estimate: remaining,
            ceiling,
        })
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(32_000)
    }
}

/// 按 user 消息切分交换；首个 user 之前的消息并入第一个交换
fn exchanges(messages: &[Message]) -> Vec<Range<usize>> {
    if messages.is_empty() {
        return Vec::new();
    }
    let mut starts: Vec<usize> = messages
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role() == Role::User)
        .map(|(i, _)| i)
        .collect();
    match starts.first_mut() {
        Some(first) => *first = 0,
        None => starts.push(0),
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, &start)| start..starts.get(i + 1).copied().unwrap_or(messages.len()))
        .collect()
}

/// 可丢弃单元，按从旧到新：除最后一个以外的交换，然后是最后一个交换内除最新一步外的步骤
fn droppable_units(messages: &[Message]) -> Vec<Range<usize>> {
    let groups = exchanges(messages);
    let Some((last, earlier)) = groups.split_last() else {
        return Vec::new();
    };

    let step_starts: Vec<usize> = (last.start..last.end)
        .filter(|&i| i > last.start && messages[i].role() == Role::Assistant)
        .collect();
    let steps = step_starts
        .iter()
        .enumerate()
        .map(|(i, &start)| start..step_starts.get(i + 1).copied().unwrap_or(last.end));

    let mut units = earlier.to_vec();
    units.extend(steps.take(step_starts.len().saturating_sub(1)));
    units
}

fn retain_outside(messages: &[Message], removed: &[Range<usize>]) -> Vec<Message> {
    messages
        .iter()
        .enumerate()
        .filter(|(i, _)| !removed.iter().any(|r| r.contains(i)))
        .map(|(_, m)| m.clone())
        .collect()
}

fn summarize(dropped: &[Message], exchanges: usize) -> Message {
    let user_messages = dropped.iter().filter(|m| m.role() == Role::User).count();
    let tool_calls: usize = dropped.iter().map(|m| m.invocations().len()).sum();
    let first_request = dropped
        .iter()
        .find(|m| m.role() == Role::User)
        .map(|m| m.content().chars().take(SUMMARY_QUOTE_CHARS).collect::<String>())
        .unwrap_or_default();

    Message::system(format!(
        "[Earlier conversation compressed: {exchanges} exchanges or steps, {user_messages} user messages, \
         {tool_calls} tool calls. First request: \"{first_request}\"]"
    ))
}
