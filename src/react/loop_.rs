//! 回合主循环（状态机）
//!
//! ROUTING（路由一次，选定系统指令）-> MODEL_CALL（压缩、编码、经 RetryController 调用、消费事件）
//! -> 无工具调用则 DONE，否则 AWAITING_TOOLS -> TOOL_EXEC（按发出顺序逐个执行并追加配对结果）-> 下一次 MODEL_CALL。
//! 三个挂起点（下一个 chunk、确认、工具执行）都会检查取消；取消时剩余调用追加显式跳过标记，对话中不留悬空调用。

use std::collections::HashSet;
use std::ops::Range;

use futures_util::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentComponents;
use crate::core::{AgentError, Turn, TurnOutcome, TurnPhase};
use crate::llm::{
    ErrorKind, ModelRequest, ProviderError, ProviderEvent, ProviderEventStream, TokenUsage,
};
use crate::memory::{Conversation, Message, TokenEstimator, ToolInvocation, ToolResult};
use crate::react::TurnEvent;
use crate::tools::ConfirmationPolicy;

const SKIP_REASON: &str = "skipped: turn cancelled before this tool ran";

/// 单个回合的运行上下文
pub struct TurnContext<'a> {
    pub components: &'a AgentComponents,
    pub cancel_token: CancellationToken,
    /// 可选：事件推送通道
    pub event_tx: Option<&'a UnboundedSender<TurnEvent>>,
}

impl<'a> TurnContext<'a> {
    pub fn new(components: &'a AgentComponents, cancel_token: CancellationToken) -> Self {
        Self {
            components,
            cancel_token,
            event_tx: None,
        }
    }

    /// 设置事件推送通道
    pub fn with_event_tx(mut self, tx: &'a UnboundedSender<TurnEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }
}

/// 回合结束后的报告：终止结果、最终文本、本回合在对话中的消息区间
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: String,
    /// 路由选中的子代理
    pub profile: Option<String>,
    pub delegation_notice: Option<String>,
    pub outcome: TurnOutcome,
    pub final_text: String,
    /// 模型调用次数
    pub steps: usize,
    pub model: Option<String>,
    pub usage: TokenUsage,
    /// 本回合追加的消息在 Conversation 中的区间（含用户输入）
    pub messages: Range<usize>,
}

impl TurnReport {
    /// 与终止结果对应的最后一个事件
    pub fn terminal_event(&self) -> TurnEvent {
        match &self.outcome {
            TurnOutcome::Completed | TurnOutcome::Pending => TurnEvent::TurnDone {
                final_text: self.final_text.clone(),
                notice: None,
            },
            TurnOutcome::StepLimitReached { steps } => TurnEvent::TurnDone {
                final_text: self.final_text.clone(),
                notice: Some(AgentError::TurnStepLimitExceeded(*steps).to_string()),
            },
            TurnOutcome::Failed(e) => TurnEvent::TurnError {
                kind: e.kind().to_string(),
                message: e.to_string(),
            },
            TurnOutcome::Cancelled => TurnEvent::TurnCancelled,
        }
    }

    /// 从已完成回合的对话重建事件流（文本增量按消息合并为一个）
    pub fn replay(&self, conversation: &Conversation) -> Vec<TurnEvent> {
        let mut events = vec![TurnEvent::TurnStarted {
            turn_id: self.turn_id.clone(),
        }];
        if let (Some(profile), Some(notice)) = (&self.profile, &self.delegation_notice) {
            events.push(TurnEvent::DelegationNotice {
                profile: profile.clone(),
                notice: notice.clone(),
            });
        }

        let messages = conversation.messages();
        let range = self.messages.start.min(messages.len())..self.messages.end.min(messages.len());
        let mut pending: Vec<&ToolInvocation> = Vec::new();
        for message in &messages[range] {
            match message {
                Message::Assistant {
                    content,
                    invocations,
                } => {
                    if !content.is_empty() {
                        events.push(TurnEvent::TextDelta {
                            text: content.clone(),
                        });
                    }
                    pending = invocations.iter().collect();
                }
                Message::Tool { result } => {
                    let invocation = pending
                        .iter()
                        .find(|inv| inv.id == result.invocation_id);
                    if let (false, Some(inv)) = (result.is_skipped(), invocation) {
                        events.push(TurnEvent::ToolStarted {
                            invocation_id: inv.id.clone(),
                            name: inv.tool_name.clone(),
                            args: inv.arguments.clone(),
                        });
                    }
                    events.push(TurnEvent::ToolFinished {
                        result: result.clone(),
                    });
                }
                Message::User { .. } | Message::System { .. } => {}
            }
        }

        events.push(self.terminal_event());
        events
    }

    /// DONE（含步数上限）返回最终文本，其余返回对应错误
    pub fn into_result(self) -> Result<String, AgentError> {
        match self.outcome.error() {
            Some(e) if !self.outcome.is_done() => Err(e),
            _ => Ok(self.final_text),
        }
    }
}

/// 单次模型调用的结果
enum StepOutcome {
    /// 完整的一步：文本 + 工具调用
    Finished {
        text: String,
        invocations: Vec<ToolInvocation>,
    },
    Cancelled,
    Failed(AgentError),
}

/// 执行一个回合：把用户输入及本回合产生的消息追加到 conversation，返回报告
pub async fn run_turn(
    ctx: &TurnContext<'_>,
    conversation: &mut Conversation,
    approvals: &mut ConfirmationPolicy,
    user_input: &str,
) -> TurnReport {
    let components = ctx.components;
    let mut turn = Turn::new(components.max_steps.max(1));
    let start = conversation.len();
    ctx.emit(TurnEvent::TurnStarted {
        turn_id: turn.id.clone(),
    });

    // ROUTING
    let profile = components.router.classify(user_input);
    let system: &str = profile
        .map(|p| p.instruction.as_str())
        .unwrap_or(components.system_prompt.as_str());
    let delegation_notice = profile.map(|p| p.notice());
    if let (Some(p), Some(notice)) = (profile, &delegation_notice) {
        ctx.emit(TurnEvent::DelegationNotice {
            profile: p.name.clone(),
            notice: notice.clone(),
        });
    }

    conversation.push(Message::user(user_input));
    let mut final_text = String::new();

    loop {
        if ctx.cancel_token.is_cancelled() {
            turn.finish(TurnOutcome::Cancelled);
            break;
        }
        if turn.remaining_steps() == 0 {
            warn!(turn_id = %turn.id, steps = turn.steps, "step limit reached");
            turn.finish(TurnOutcome::StepLimitReached { steps: turn.steps });
            break;
        }

        turn.transition(TurnPhase::ModelCall);
        let (text, invocations) = match model_step(ctx, &mut turn, conversation, system).await {
            StepOutcome::Finished { text, invocations } => (text, invocations),
            StepOutcome::Cancelled => {
                turn.finish(TurnOutcome::Cancelled);
                break;
            }
            StepOutcome::Failed(e) => {
                warn!(turn_id = %turn.id, error = %e, "turn failed");
                turn.finish(TurnOutcome::Failed(e));
                break;
            }
        };

        if !text.is_empty() {
            final_text = text.clone();
        }
        conversation.push(Message::assistant_with_invocations(text, invocations.clone()));

        if invocations.is_empty() {
            turn.finish(TurnOutcome::Completed);
            break;
        }

        turn.transition(TurnPhase::AwaitingTools);
        turn.transition(TurnPhase::ToolExec);
        if !execute_tools(ctx, conversation, approvals, &invocations).await {
            turn.finish(TurnOutcome::Cancelled);
            break;
        }
    }

    let report = TurnReport {
        turn_id: turn.id.clone(),
        profile: profile.map(|p| p.name.clone()),
        delegation_notice,
        outcome: turn.outcome.clone(),
        final_text,
        steps: turn.steps,
        model: turn.model.clone(),
        usage: turn.usage,
        messages: start..conversation.len(),
    };
    info!(
        turn_id = %report.turn_id,
        phase = ?turn.phase,
        steps = report.steps,
        total_tokens = report.usage.total_tokens,
        "turn finished"
    );
    ctx.emit(report.terminal_event());
    report
}

/// MODEL_CALL：压缩 -> 编码 -> 经重试控制器建立流 -> 消费事件直到 completion
async fn model_step(
    ctx: &TurnContext<'_>,
    turn: &mut Turn,
    conversation: &Conversation,
    system: &str,
) -> StepOutcome {
    let components = ctx.components;
    let tools = components.executor.registry().schemas();

    // 系统指令与工具声明随每次请求发出，先从上限中扣除
    let overhead = TokenEstimator::estimate(system)
        + TokenEstimator::estimate(&serde_json::to_string(&tools).unwrap_or_default());
    let ceiling = components.budget.message_ceiling(overhead);

    // 压缩只作用于发出的副本，对话本身保持只追加
    let compressed = match components.budget.compress(conversation.messages(), ceiling) {
        Ok(c) => c,
        Err(AgentError::BudgetExceeded { estimate, .. }) => {
            return StepOutcome::Failed(AgentError::BudgetExceeded {
                estimate: estimate + overhead,
                ceiling: components.budget.ceiling(),
            })
        }
        Err(e) => return StepOutcome::Failed(e),
    };
    if compressed.dropped_exchanges > 0 {
        info!(
            turn_id = %turn.id,
            dropped = compressed.dropped_exchanges,
            strategy = ?components.budget.strategy(),
            estimate = compressed.estimate + overhead,
            "history compressed to fit token budget"
        );
    }
    turn.token_estimate = compressed.estimate + overhead;

    let call = components.retry.call(&components.models, |model| {
        let request = components.adapter.encode_request(&ModelRequest {
            messages: &compressed.messages,
            system,
            tools: &tools,
            model: &model,
            stream: components.stream,
        });
        let transport = components.transport.clone();
        let adapter = components.adapter.clone();
        async move {
            let raw = transport
                .send(request)
                .await
                .map_err(|e| adapter.decode_error(&e))?;
            Ok(adapter.decode_stream(raw))
        }
    });

    let established = tokio::select! {
        biased;
        _ = ctx.cancel_token.cancelled() => None,
        res = call => Some(res),
    };
    let established = match established {
        None => return StepOutcome::Cancelled,
        Some(Err(e)) => return StepOutcome::Failed(e),
        Some(Ok(est)) => est,
    };
    turn.steps += 1;
    debug!(turn_id = %turn.id, model = %established.model, attempts = established.attempts, "model stream established");
    turn.model = Some(established.model.clone());

    // 首个事件之前的错误已由重试控制器处理；此后出错时调用方已收到部分输出，不能重放
    match consume(ctx, turn, established.stream).await {
        Consumed::Finished {
            text,
            mut invocations,
        } => {
            ensure_unique_ids(&mut invocations);
            StepOutcome::Finished { text, invocations }
        }
        Consumed::Cancelled => StepOutcome::Cancelled,
        Consumed::Interrupted { error } => {
            warn!(turn_id = %turn.id, kind = %error.kind, error = %error.message, "stream interrupted mid-response");
            StepOutcome::Failed(AgentError::ProviderFatal(format!(
                "stream interrupted mid-response: {error}"
            )))
        }
    }
}

/// 一次流的消费结果
enum Consumed {
    Finished {
        text: String,
        invocations: Vec<ToolInvocation>,
    },
    Cancelled,
    /// 流在 completion 前出错
    Interrupted { error: ProviderError },
}

/// 消费事件直到 completion：文本实时转发，调用请求累积
async fn consume(ctx: &TurnContext<'_>, turn: &mut Turn, mut stream: ProviderEventStream) -> Consumed {
    let mut text = String::new();
    let mut invocations: Vec<ToolInvocation> = Vec::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => return Consumed::Cancelled,
            event = stream.next() => event,
        };
        let error = match event {
            Some(ProviderEvent::TextDelta(delta)) => {
                ctx.emit(TurnEvent::TextDelta {
                    text: delta.clone(),
                });
                text.push_str(&delta);
                continue;
            }
            Some(ProviderEvent::InvocationRequest(invocation)) => {
                invocations.push(invocation);
                continue;
            }
            Some(ProviderEvent::Completion {
                finish_reason,
                usage,
            }) => {
                debug!(turn_id = %turn.id, finish_reason = ?finish_reason, invocations = invocations.len(), "model step completed");
                if let Some(usage) = usage {
                    turn.usage.add(usage);
                }
                return Consumed::Finished { text, invocations };
            }
            Some(ProviderEvent::Error(e)) => e,
            None => ProviderError::new(ErrorKind::Network, "stream ended without completion"),
        };
        return Consumed::Interrupted { error };
    }
}

/// 缺失或重复的调用 id 由编排器补齐，保证配对可区分
fn ensure_unique_ids(invocations: &mut [ToolInvocation]) {
    let mut seen: HashSet<String> = HashSet::new();
    for invocation in invocations.iter_mut() {
        if invocation.id.is_empty() || seen.contains(&invocation.id) {
            invocation.id = format!("call_{}", uuid::Uuid::new_v4().simple());
        }
        seen.insert(invocation.id.clone());
    }
}

/// TOOL_EXEC：按发出顺序执行；返回 false 表示被取消（剩余调用已追加跳过标记）
async fn execute_tools(
    ctx: &TurnContext<'_>,
    conversation: &mut Conversation,
    approvals: &mut ConfirmationPolicy,
    invocations: &[ToolInvocation],
) -> bool {
    let components = ctx.components;

    for (index, invocation) in invocations.iter().enumerate() {
        if ctx.cancel_token.is_cancelled() {
            skip_remaining(ctx, conversation, &invocations[index..]);
            return false;
        }

        ctx.emit(TurnEvent::ToolStarted {
            invocation_id: invocation.id.clone(),
            name: invocation.tool_name.clone(),
            args: invocation.arguments.clone(),
        });
        let result = tokio::select! {
            biased;
            _ = ctx.cancel_token.cancelled() => None,
            result = components.executor.execute(invocation, approvals, components.confirmation.as_ref()) => Some(result),
        };

        match result {
            Some(result) => {
                conversation.push(Message::tool(result.clone()));
                ctx.emit(TurnEvent::ToolFinished { result });
            }
            None => {
                // 执行中被取消：本次调用同样记为跳过
                skip_remaining(ctx, conversation, &invocations[index..]);
                return false;
            }
        }
    }
    true
}

fn skip_remaining(ctx: &TurnContext<'_>, conversation: &mut Conversation, rest: &[ToolInvocation]) {
    info!(skipped = rest.len(), "turn cancelled, skipping queued tools");
    for invocation in rest {
        let result = ToolResult::skipped(invocation.id.clone(), SKIP_REASON);
        conversation.push(Message::tool(result.clone()));
        ctx.emit(TurnEvent::ToolFinished { result });
    }
}
