//! 工具执行器
//!
//! 单次调用的管线：查找工具 -> 参数校验 -> 用户确认 -> 超时内执行 -> 截断输出。
//! 任何一步失败都转为 error 状态的 ToolResult（不会让回合失败）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::memory::{ToolErrorKind, ToolInvocation, ToolResult};
use crate::tools::{validate_arguments, Approval, ConfirmationChannel, ConfirmationPolicy, ToolRegistry};

/// 工具执行器：对每次调用施加超时，并将结果映射为 ToolResult
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
    max_result_chars: usize,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry: Arc::new(registry),
            timeout: Duration::from_secs(timeout_secs),
            max_result_chars: 20_000,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_result_chars(mut self, max: usize) -> Self {
        self.max_result_chars = max;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// 执行一次调用，总是返回与 invocation.id 配对的结果
    pub async fn execute(
        &self,
        invocation: &ToolInvocation,
        policy: &mut ConfirmationPolicy,
        channel: &dyn ConfirmationChannel,
    ) -> ToolResult {
        let start = Instant::now();
        let outcome = self.run(invocation, policy, channel).await;

        let (ok, label) = match &outcome {
            Ok(_) => (true, "ok"),
            Err(e) => (false, e.kind()),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": invocation.tool_name,
            "invocation_id": invocation.id,
            "ok": ok,
            "outcome": label,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(&invocation.arguments),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match outcome {
            Ok(payload) => ToolResult::ok(invocation.id.clone(), payload),
            Err(e) => ToolResult::error(invocation.id.clone(), error_kind(&e), e.to_string()),
        }
    }

    async fn run(
        &self,
        invocation: &ToolInvocation,
        policy: &mut ConfirmationPolicy,
        channel: &dyn ConfirmationChannel,
    ) -> Result<Value, AgentError> {
        let name = invocation.tool_name.as_str();
        let tool = self.registry.get(name).ok_or_else(|| {
            AgentError::UnknownTool(format!(
                "{name} (available: {})",
                self.registry.tool_names().join(", ")
            ))
        })?;

        validate_arguments(&tool.parameters_schema(), &invocation.arguments).map_err(|reason| {
            AgentError::InvalidArguments {
                tool: name.to_string(),
                reason,
            }
        })?;

        if policy.needs_approval(name, tool.requires_confirmation()) {
            let approval = channel.request_approval(invocation).await;
            tracing::info!(tool = %name, approval = ?approval, "confirmation answered");
            policy.remember(name, approval);
            if approval == Approval::Rejected {
                return Err(AgentError::UserRejected(name.to_string()));
            }
        }

        let output = timeout(self.timeout, tool.execute(invocation.arguments.clone()))
            .await
            .map_err(|_| AgentError::ToolExecutionFault {
                tool: name.to_string(),
                message: format!("timed out after {}s", self.timeout.as_secs_f64()),
            })?
            .map_err(|message| AgentError::ToolExecutionFault {
                tool: name.to_string(),
                message,
            })?;

        Ok(truncate_output(output, self.max_result_chars))
    }
}

fn error_kind(err: &AgentError) -> ToolErrorKind {
    match err {
        AgentError::UnknownTool(_) => ToolErrorKind::UnknownTool,
        AgentError::InvalidArguments { .. } => ToolErrorKind::InvalidArguments,
        AgentError::UserRejected(_) => ToolErrorKind::UserRejected,
        _ => ToolErrorKind::ExecutionFailed,
    }
}

/// 过长的字符串输出截断；结构化输出按序列化长度判断，超长则转为截断后的文本
fn truncate_output(output: Value, max_chars: usize) -> Value {
    let text = match &output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let total = text.chars().count();
    if total <= max_chars {
        return output;
    }
    let kept: String = text.chars().take(max_chars).collect();
    Value::String(format!("{kept}\n... [truncated, {total} chars total]"))
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
