//! Mock LLM 客户端（用于测试与无 API Key 场景）
//!
//! MockLlmClient 回显最后一条 User 消息为纯文本（监督者侧解析为 Finish，
//! 工作者侧解析为最终回答）；ScriptedLlmClient 按预置脚本逐条出队，
//! 供集成测试精确驱动 监督者/工作者/评审门 的多轮交互。

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, LlmError};
use crate::session::{Message, Role};

/// Mock 客户端：回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("Echo from Mock: {}", last_user))
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn futures_util::Stream<Item = Result<String, LlmError>> + Send>>, LlmError>
    {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}

/// 脚本客户端：每次 complete 从队列头部取一条预置输出
///
/// 队列耗尽视为脚本编写错误，返回 Api 错误而非空串，便于测试定位。
pub struct ScriptedLlmClient {
    outputs: Mutex<VecDeque<String>>,
}

impl ScriptedLlmClient {
    pub fn new(outputs: Vec<impl Into<String>>) -> Self {
        Self {
            outputs: Mutex::new(outputs.into_iter().map(Into::into).collect()),
        }
    }

    /// 剩余未消费的脚本条数
    pub fn remaining(&self) -> usize {
        self.outputs.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.outputs
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Api("scripted client exhausted".to_string()))
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn futures_util::Stream<Item = Result<String, LlmError>> + Send>>, LlmError>
    {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}
