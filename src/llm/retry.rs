//! 模型调用重试包装
//!
//! 外部模型调用按可重试/不可重试分类：Timeout 与 RateLimited 按退避间隔重试
//! 至多 max_retries 次，其余错误直接透传。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;

use crate::llm::{LlmClient, LlmError};
use crate::session::Message;

/// 重试策略：次数与基础退避间隔（RateLimited 优先采用服务端给出的间隔）
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_ms: 500,
        }
    }
}

/// 包装任意 LlmClient，对可重试错误做有界退避重试
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn backoff(&self, attempt: usize, err: &LlmError) -> Duration {
        match err {
            LlmError::RateLimited { retry_after_ms } => Duration::from_millis(*retry_after_ms),
            _ => Duration::from_millis(self.config.backoff_ms * (attempt as u64 + 1)),
        }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(messages).await {
                Ok(out) => return Ok(out),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let wait = self.backoff(attempt, &e);
                    tracing::warn!("LLM call failed ({}), retrying in {:?}", e, wait);
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError> {
        self.inner.complete_stream(messages).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::stream;

    /// 前 N 次返回 Timeout，之后成功
    struct FlakyClient {
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(LlmError::Timeout)
            } else {
                Ok("ok".to_string())
            }
        }

        async fn complete_stream(
            &self,
            messages: &[Message],
        ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError>
        {
            let content = self.complete(messages).await?;
            Ok(Box::pin(stream::iter(vec![Ok(content)])))
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let client = RetryingLlmClient::new(
            Arc::new(FlakyClient {
                fail_first: 2,
                calls: AtomicUsize::new(0),
            }),
            RetryConfig {
                max_retries: 2,
                backoff_ms: 1,
            },
        );
        let out = client.complete(&[Message::user("hi")]).await.unwrap();
        assert_eq!(out, "ok");
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let client = RetryingLlmClient::new(
            Arc::new(FlakyClient {
                fail_first: 5,
                calls: AtomicUsize::new(0),
            }),
            RetryConfig {
                max_retries: 1,
                backoff_ms: 1,
            },
        );
        assert!(client.complete(&[Message::user("hi")]).await.is_err());
    }
}
