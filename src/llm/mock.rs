//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 按脚本依次返回预置的响应或错误；脚本耗尽后回显最后一条用户文本，便于本地跑通采样循环。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::types::{LlmError, MessageRequest, MessageResponse};
use crate::llm::LlmClient;
use crate::memory::{ContentBlock, Usage, WireRole};

/// Mock 客户端：脚本化响应 + 请求记录
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<MessageResponse, LlmError>>>,
    requests: Mutex<Vec<MessageRequest>>,
    token_count: Option<u64>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(steps: impl IntoIterator<Item = Result<MessageResponse, LlmError>>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    /// count_tokens 固定返回该值
    pub fn with_token_count(mut self, tokens: u64) -> Self {
        self.token_count = Some(tokens);
        self
    }

    /// 收到的全部请求（按顺序）
    pub fn requests(&self) -> Vec<MessageRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

/// 纯文本回复
pub fn text_reply(text: &str) -> MessageResponse {
    MessageResponse {
        id: format!("mock_{}", uuid::Uuid::new_v4()),
        content: vec![ContentBlock::text(text)],
        stop_reason: Some("end_turn".to_string()),
        usage: Usage::default(),
    }
}

/// 工具调用回复：(id, name, input)
pub fn tool_reply(calls: &[(&str, &str, Value)]) -> MessageResponse {
    MessageResponse {
        id: format!("mock_{}", uuid::Uuid::new_v4()),
        content: calls
            .iter()
            .map(|(id, name, input)| ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: input.clone(),
            })
            .collect(),
        stop_reason: Some("tool_use".to_string()),
        usage: Usage::default(),
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn create_message(&self, request: &MessageRequest) -> Result<MessageResponse, LlmError> {
        if let Ok(mut log) = self.requests.lock() {
            log.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        if let Some(step) = next {
            return step;
        }

        let last_user = request
            .messages
            .iter()
            .rev()
            .filter(|m| m.role == WireRole::User)
            .flat_map(|m| m.content.iter())
            .find_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .unwrap_or("(no input)");
        Ok(text_reply(&format!("Echo from Mock: {}", last_user)))
    }

    async fn count_tokens(&self, _request: &MessageRequest) -> Result<u64, LlmError> {
        self.token_count.ok_or(LlmError::Unsupported("count_tokens"))
    }
}
