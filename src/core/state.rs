//! 回合状态：阶段、终止结果与运行中的 Turn
//!
//! ROUTING -> MODEL_CALL -> (DONE | AWAITING_TOOLS) -> TOOL_EXEC -> MODEL_CALL ... -> DONE | ERROR | CANCELLED

use serde::Serialize;

use crate::core::AgentError;
use crate::llm::TokenUsage;

/// 回合阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnPhase {
    Routing,
    ModelCall,
    AwaitingTools,
    ToolExec,
    Done,
    Error,
    Cancelled,
}

impl TurnPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnPhase::Done | TurnPhase::Error | TurnPhase::Cancelled)
    }
}

/// 回合的终止结果
#[derive(Clone, Debug, PartialEq)]
pub enum TurnOutcome {
    Pending,
    /// 模型给出不含工具调用的回复
    Completed,
    /// 达到步数上限后强制结束（仍视为 DONE，附截断提示）
    StepLimitReached { steps: usize },
    Failed(AgentError),
    Cancelled,
}

impl TurnOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, TurnOutcome::Completed | TurnOutcome::StepLimitReached { .. })
    }

    /// 非 DONE 结果对应的错误
    pub fn error(&self) -> Option<AgentError> {
        match self {
            TurnOutcome::Failed(e) => Some(e.clone()),
            TurnOutcome::Cancelled => Some(AgentError::TurnCancelled),
            TurnOutcome::StepLimitReached { steps } => Some(AgentError::TurnStepLimitExceeded(*steps)),
            _ => None,
        }
    }
}

/// 单个回合的运行状态（回合结束即丢弃，结果已并入 Conversation）
#[derive(Debug)]
pub struct Turn {
    pub id: String,
    pub phase: TurnPhase,
    /// 已完成的模型调用次数
    pub steps: usize,
    pub max_steps: usize,
    /// 最近一次请求的 token 估算
    pub token_estimate: usize,
    /// 最近应答的模型
    pub model: Option<String>,
    pub usage: TokenUsage,
    pub outcome: TurnOutcome,
}

impl Turn {
    pub fn new(max_steps: usize) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            phase: TurnPhase::Routing,
            steps: 0,
            max_steps,
            token_estimate: 0,
            model: None,
            usage: TokenUsage::default(),
            outcome: TurnOutcome::Pending,
        }
    }

    pub fn transition(&mut self, next: TurnPhase) {
        tracing::debug!(turn_id = %self.id, from = ?self.phase, to = ?next, step = self.steps, "turn transition");
        self.phase = next;
    }

    pub fn remaining_steps(&self) -> usize {
        self.max_steps.saturating_sub(self.steps)
    }

    /// 设置终止结果并进入对应的终止阶段
    pub fn finish(&mut self, outcome: TurnOutcome) {
        let phase = match &outcome {
            TurnOutcome::Failed(_) => TurnPhase::Error,
            TurnOutcome::Cancelled => TurnPhase::Cancelled,
            _ => TurnPhase::Done,
        };
        self.transition(phase);
        self.outcome = outcome;
    }
}
