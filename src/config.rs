//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__LLM__MODEL=gpt-4o`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::memory::CompressionStrategy;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub turn: TurnSection,
    pub retry: RetrySection,
    pub tools: ToolsSection,
    pub router: RouterSection,
}

/// [app] 段：应用名、系统提示词文件
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 未设置时使用内置提示词
    pub system_prompt_path: Option<PathBuf>,
}

/// [llm] 段：provider、模型与回退链、凭据、超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// auto / gemini / openai / kimi / deepseek；auto 按模型名识别
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// 主模型重试耗尽后依次尝试
    #[serde(default)]
    pub fallback_models: Vec<String>,
    pub base_url: Option<String>,
    /// 存放 API Key 的环境变量名；未设置时按 provider 取默认
    pub api_key_env: Option<String>,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            fallback_models: Vec::new(),
            base_url: None,
            api_key_env: None,
            stream: default_stream(),
            max_output_tokens: default_max_output_tokens(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "auto".to_string()
}

fn default_model() -> String {
    "gemini-2.0-flash".to_string()
}

fn default_stream() -> bool {
    true
}

fn default_max_output_tokens() -> u32 {
    8192
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 建立请求（拿到响应头）的超时，秒
    #[serde(default = "default_request_timeout")]
    pub request: u64,
    /// 流式响应相邻两个 chunk 之间的最长等待，秒
    #[serde(default = "default_idle_timeout")]
    pub idle: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
            idle: default_idle_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    90
}

/// [turn] 段：步数上限、Token 预算
#[derive(Debug, Clone, Deserialize)]
pub struct TurnSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_token_ceiling")]
    pub token_ceiling: usize,
    #[serde(default)]
    pub compression: CompressionStrategy,
}

impl Default for TurnSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            token_ceiling: default_token_ceiling(),
            compression: CompressionStrategy::default(),
        }
    }
}

fn default_max_steps() -> usize {
    20
}

fn default_token_ceiling() -> usize {
    32_000
}

/// [retry] 段：每个模型的尝试次数与退避
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// [tools] 段：确认策略、工具超时、输出截断
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 为 true 时需确认的工具也直接执行
    #[serde(default)]
    pub auto_approve: bool,
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    #[serde(default = "default_max_result_chars")]
    pub max_result_chars: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            auto_approve: false,
            tool_timeout_secs: default_tool_timeout_secs(),
            max_result_chars: default_max_result_chars(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_result_chars() -> usize {
    20_000
}

/// [router] 段：子代理 profile
#[derive(Debug, Clone, Deserialize)]
pub struct RouterSection {
    /// 额外 profile 文件（[[profile]] 列表），追加在内置 profile 之后
    pub profiles_path: Option<PathBuf>,
    #[serde(default = "default_include_builtin")]
    pub include_builtin: bool,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            profiles_path: None,
            include_builtin: default_include_builtin(),
        }
    }
}

fn default_include_builtin() -> bool {
    true
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
