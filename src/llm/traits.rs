//! LLM 客户端抽象
//!
//! 所有后端（Anthropic Messages API / Mock）实现 LlmClient：create_message 发送一次请求，
//! count_tokens 用于校准本地 token 账本（可选）。

use async_trait::async_trait;

use crate::llm::types::{LlmError, MessageRequest, MessageResponse};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 发送一次完整请求，返回有序内容块与 usage
    async fn create_message(&self, request: &MessageRequest) -> Result<MessageResponse, LlmError>;

    /// 远端计数：返回该请求的输入 token 数。默认不支持，调用方回退到本地估算
    async fn count_tokens(&self, _request: &MessageRequest) -> Result<u64, LlmError> {
        Err(LlmError::Unsupported("count_tokens"))
    }
}
