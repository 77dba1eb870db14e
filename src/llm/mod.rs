//! LLM 层：协议适配器（Gemini 结构化调用 / OpenAI 兼容 tool_calls）、流解码、重试回退与传输

pub mod error;
pub mod gemini;
pub mod http;
pub mod markers;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod stream;
pub mod traits;

pub use error::{ErrorKind, ProviderError, TransportError};
pub use gemini::GeminiAdapter;
pub use http::{AuthScheme, HttpTransport};
pub use mock::{ScriptedReply, ScriptedTransport};
pub use openai::OpenAiCompatAdapter;
pub use provider::Provider;
pub use retry::{Established, RetryController, RetryPolicy};
pub use traits::{
    EncodedRequest, ModelRequest, ProviderAdapter, ProviderEvent, ProviderEventStream,
    ProviderFamily, RawStream, StreamDecoder, TokenUsage, Transport,
};
