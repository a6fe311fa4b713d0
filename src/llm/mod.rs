//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / 重试包装）

pub mod mock;
pub mod openai;
pub mod retry;
pub mod traits;

pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use retry::{RetryConfig, RetryingLlmClient};
pub use traits::{LlmClient, LlmError};
