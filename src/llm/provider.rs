//! Provider 选择
//!
//! provider = "auto" 时按模型名前缀识别：kimi-/moonshot- 走 Kimi，gpt-/o1-/o3- 走 OpenAI，
//! deepseek- 走 DeepSeek，gemini- 走 Gemini。OpenAI 兼容族都启用内联标记回退（Kimi 会用到）。

use std::sync::Arc;

use crate::core::AgentError;
use crate::llm::gemini::GeminiAdapter;
use crate::llm::http::AuthScheme;
use crate::llm::openai::OpenAiCompatAdapter;
use crate::llm::traits::{ProviderAdapter, ProviderFamily};

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const KIMI_BASE_URL: &str = "https://api.moonshot.cn/v1";
pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Gemini,
    OpenAi,
    Kimi,
    DeepSeek,
}

impl Provider {
    /// 按模型名前缀识别
    pub fn detect(model: &str) -> Option<Self> {
        let model = model.trim().to_lowercase();
        if model.starts_with("kimi-") || model.starts_with("moonshot-") {
            Some(Provider::Kimi)
        } else if model.starts_with("gpt-") || model.starts_with("o1-") || model.starts_with("o3-") {
            Some(Provider::OpenAi)
        } else if model.starts_with("deepseek-") {
            Some(Provider::DeepSeek)
        } else if model.starts_with("gemini-") {
            Some(Provider::Gemini)
        } else {
            None
        }
    }

    /// 配置中的 provider 名；"auto" 交给 detect
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "gemini" | "google" => Some(Provider::Gemini),
            "openai" => Some(Provider::OpenAi),
            "kimi" | "moonshot" => Some(Provider::Kimi),
            "deepseek" => Some(Provider::DeepSeek),
            _ => None,
        }
    }

    /// 配置的 provider 名 + 模型名 -> Provider
    pub fn resolve(name: &str, model: &str) -> Result<Self, AgentError> {
        if name.trim().eq_ignore_ascii_case("auto") {
            return Self::detect(model).ok_or_else(|| {
                AgentError::Config(format!(
                    "cannot detect provider for model '{model}', set llm.provider explicitly"
                ))
            });
        }
        Self::parse(name).ok_or_else(|| AgentError::Config(format!("unknown provider '{name}'")))
    }

    pub fn family(self) -> ProviderFamily {
        match self {
            Provider::Gemini => ProviderFamily::Gemini,
            _ => ProviderFamily::OpenAiCompat,
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Provider::Gemini => GEMINI_BASE_URL,
            Provider::OpenAi => OPENAI_BASE_URL,
            Provider::Kimi => KIMI_BASE_URL,
            Provider::DeepSeek => DEEPSEEK_BASE_URL,
        }
    }

    pub fn default_api_key_env(self) -> &'static str {
        match self {
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Kimi => "MOONSHOT_API_KEY",
            Provider::DeepSeek => "DEEPSEEK_API_KEY",
        }
    }

    pub fn auth_scheme(self) -> AuthScheme {
        match self {
            Provider::Gemini => AuthScheme::GoogApiKey,
            _ => AuthScheme::Bearer,
        }
    }

    /// 回退模型共用主模型的适配器与端点：能识别出其他 provider 的模型名视为配置错误
    pub fn check_fallbacks(self, models: &[String]) -> Result<(), AgentError> {
        for model in models {
            match Self::detect(model) {
                Some(other) if other != self => {
                    return Err(AgentError::Config(format!(
                        "fallback model '{model}' belongs to {other:?}, but the primary provider is {self:?}"
                    )))
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn adapter(self, max_output_tokens: u32) -> Arc<dyn ProviderAdapter> {
        match self {
            Provider::Gemini => {
                Arc::new(GeminiAdapter::new().with_max_output_tokens(max_output_tokens))
            }
            Provider::OpenAi | Provider::Kimi | Provider::DeepSeek => Arc::new(
                OpenAiCompatAdapter::new()
                    .with_max_output_tokens(max_output_tokens)
                    .with_stream_usage(self != Provider::Kimi),
            ),
        }
    }
}
