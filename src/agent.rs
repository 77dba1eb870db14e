//! Headless Agent 运行时
//!
//! create_agent_components 按配置构建协议适配器、传输、重试控制器、工具执行器、任务路由与 Token 预算，
//! 可在多个会话间共享；Session 持有一个会话的对话历史、确认状态与取消令牌，一次只跑一个回合。

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, SessionSupervisor};
use crate::llm::{
    HttpTransport, Provider, ProviderAdapter, RetryController, RetryPolicy, Transport,
};
use crate::memory::{Conversation, TokenBudget};
use crate::react::{run_turn, TurnContext, TurnEvent, TurnReport};
use crate::subagents::{builtin_profiles, load_profiles, TaskRouter};
use crate::tools::{ConfirmationChannel, ConfirmationPolicy, ToolExecutor, ToolRegistry};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Use the available tools when they help answer the request, and answer directly when they do not.";

/// 预构建的 Agent 组件（启动后只读），可多会话共享
pub struct AgentComponents {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub transport: Arc<dyn Transport>,
    pub retry: RetryController,
    pub executor: ToolExecutor,
    pub router: Arc<TaskRouter>,
    pub budget: TokenBudget,
    pub confirmation: Arc<dyn ConfirmationChannel>,
    /// 主模型在前，其后为按序回退的备用模型
    pub models: Vec<String>,
    pub system_prompt: String,
    pub max_steps: usize,
    pub stream: bool,
    pub auto_approve: bool,
}

impl AgentComponents {
    /// 最小配置：默认重试策略、无路由、默认预算
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        transport: Arc<dyn Transport>,
        executor: ToolExecutor,
        confirmation: Arc<dyn ConfirmationChannel>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            transport,
            retry: RetryController::default(),
            executor,
            router: Arc::new(TaskRouter::empty()),
            budget: TokenBudget::default(),
            confirmation,
            models: vec![model.into()],
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_steps: 20,
            stream: true,
            auto_approve: false,
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = RetryController::new(policy);
        self
    }

    pub fn with_router(mut self, router: TaskRouter) -> Self {
        self.router = Arc::new(router);
        self
    }

    pub fn with_budget(mut self, budget: TokenBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_fallback_models(mut self, models: Vec<String>) -> Self {
        self.models.extend(models);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }
}

fn read_system_prompt(path: Option<&Path>) -> Result<String, AgentError> {
    match path {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            AgentError::Config(format!("cannot read system prompt {}: {e}", path.display()))
        }),
        None => Ok(DEFAULT_SYSTEM_PROMPT.to_string()),
    }
}

/// 从配置创建 Agent 组件；路由模式或 provider 配置有误时在此处失败
pub fn create_agent_components(
    cfg: &AppConfig,
    tools: ToolRegistry,
    confirmation: Arc<dyn ConfirmationChannel>,
) -> Result<AgentComponents, AgentError> {
    let provider = Provider::resolve(&cfg.llm.provider, &cfg.llm.model)?;
    provider.check_fallbacks(&cfg.llm.fallback_models)?;
    let key_env = cfg
        .llm
        .api_key_env
        .clone()
        .unwrap_or_else(|| provider.default_api_key_env().to_string());
    let api_key = std::env::var(&key_env).unwrap_or_default();
    if api_key.is_empty() {
        tracing::warn!(env = %key_env, "API key not set, provider calls will fail");
    }
    let base_url = cfg
        .llm
        .base_url
        .clone()
        .unwrap_or_else(|| provider.default_base_url().to_string());
    let transport = HttpTransport::new(base_url, api_key, provider.auth_scheme())
        .with_request_timeout(Duration::from_secs(cfg.llm.timeouts.request))
        .with_idle_timeout(Duration::from_secs(cfg.llm.timeouts.idle));

    let mut profiles = if cfg.router.include_builtin {
        builtin_profiles()
    } else {
        Vec::new()
    };
    if let Some(path) = &cfg.router.profiles_path {
        profiles.extend(load_profiles(path)?);
    }
    let router = TaskRouter::new(profiles)?;

    let executor = ToolExecutor::new(tools, cfg.tools.tool_timeout_secs)
        .with_max_result_chars(cfg.tools.max_result_chars);
    let budget = TokenBudget::new(cfg.turn.token_ceiling).with_strategy(cfg.turn.compression);
    let retry = RetryPolicy {
        max_attempts: cfg.retry.max_attempts,
        base_delay: Duration::from_millis(cfg.retry.base_delay_ms),
        max_delay: Duration::from_millis(cfg.retry.max_delay_ms),
    };

    tracing::info!(
        provider = ?provider,
        model = %cfg.llm.model,
        fallback = ?cfg.llm.fallback_models,
        profiles = ?router.profile_names(),
        "agent components created"
    );

    Ok(AgentComponents::new(
        provider.adapter(cfg.llm.max_output_tokens),
        Arc::new(transport),
        executor,
        confirmation,
        cfg.llm.model.clone(),
    )
    .with_fallback_models(cfg.llm.fallback_models.clone())
    .with_retry(retry)
    .with_router(router)
    .with_budget(budget)
    .with_system_prompt(read_system_prompt(cfg.app.system_prompt_path.as_deref())?)
    .with_max_steps(cfg.turn.max_steps)
    .with_stream(cfg.llm.stream)
    .with_auto_approve(cfg.tools.auto_approve))
}

/// 单个会话：对话历史、确认状态、取消令牌
pub struct Session {
    components: Arc<AgentComponents>,
    conversation: Conversation,
    approvals: ConfirmationPolicy,
    supervisor: SessionSupervisor,
}

impl Session {
    pub fn new(components: Arc<AgentComponents>) -> Self {
        let approvals = ConfirmationPolicy::new(components.auto_approve);
        Self {
            components,
            conversation: Conversation::new(),
            approvals,
            supervisor: SessionSupervisor::new(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// 供其他任务触发取消
    pub fn supervisor(&self) -> SessionSupervisor {
        self.supervisor.clone()
    }

    /// 清空对话与会话内的确认记忆
    pub fn clear(&mut self) {
        self.conversation.clear();
        self.approvals = ConfirmationPolicy::new(self.components.auto_approve);
    }

    /// 运行一个回合；&mut self 保证同一会话同时只有一个回合
    pub async fn run_turn(
        &mut self,
        user_input: &str,
        event_tx: Option<&UnboundedSender<TurnEvent>>,
    ) -> TurnReport {
        let cancel_token = self.supervisor.begin_turn();
        self.run_turn_with(user_input, cancel_token, event_tx).await
    }

    /// 使用调用方预先取得的令牌运行回合（令牌须来自 supervisor().begin_turn()）
    pub async fn run_turn_with(
        &mut self,
        user_input: &str,
        cancel_token: CancellationToken,
        event_tx: Option<&UnboundedSender<TurnEvent>>,
    ) -> TurnReport {
        let mut ctx = TurnContext::new(&self.components, cancel_token);
        if let Some(tx) = event_tx {
            ctx = ctx.with_event_tx(tx);
        }
        run_turn(&ctx, &mut self.conversation, &mut self.approvals, user_input).await
    }

    /// 处理单条用户消息（无事件流），返回最终回复文本
    pub async fn process_message(&mut self, user_input: &str) -> Result<String, AgentError> {
        self.run_turn(user_input, None).await.into_result()
    }
}
