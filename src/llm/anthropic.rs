//! Anthropic Messages API 客户端
//!
//! 通过 reqwest 直接调用 /v1/messages 与 /v1/messages/count_tokens；可配置 base_url、beta 标记与 prompt caching。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::types::{LlmError, MessageRequest, MessageResponse};
use crate::llm::LlmClient;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Anthropic 客户端：持有 HTTP 连接池、鉴权与请求级开关
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    api_version: String,
    betas: Vec<String>,
    prompt_caching: bool,
}

#[derive(Deserialize)]
struct CountTokensResponse {
    input_tokens: u64,
}

impl AnthropicClient {
    /// api_key 为空时回退到环境变量 ANTHROPIC_API_KEY
    pub fn new(api_key: Option<&str>, request_timeout: Duration) -> Result<Self, LlmError> {
        let api_key = api_key
            .filter(|k| !k.is_empty())
            .map(String::from)
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| LlmError::Config("missing api key (llm.api_key / ANTHROPIC_API_KEY)".into()))?;

        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| LlmError::Config(e.to_string()))?;

        Ok(Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            api_version: DEFAULT_API_VERSION.to_string(),
            betas: Vec::new(),
            prompt_caching: false,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn with_betas(mut self, betas: Vec<String>) -> Self {
        self.betas = betas;
        self
    }

    pub fn with_prompt_caching(mut self, enabled: bool) -> Self {
        self.prompt_caching = enabled;
        self
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("content-type", "application/json");
        if !self.betas.is_empty() {
            req = req.header("anthropic-beta", self.betas.join(","));
        }
        req
    }

    fn request_body(&self, request: &MessageRequest) -> Result<Value, LlmError> {
        let mut body = serde_json::to_value(request).map_err(|e| LlmError::Decode(e.to_string()))?;
        if self.prompt_caching {
            mark_cache_breakpoint(&mut body);
        }
        Ok(body)
    }

    async fn send(&self, path: &str, body: &Value) -> Result<String, LlmError> {
        let resp = self
            .post(path)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;
        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), &text));
        }
        Ok(text)
    }
}

/// 最后一条消息的每个内容块都打上 ephemeral 缓存断点（只作用于请求体，不改历史）
pub fn mark_cache_breakpoint(body: &mut Value) {
    let Some(blocks) = body
        .get_mut("messages")
        .and_then(Value::as_array_mut)
        .and_then(|m| m.last_mut())
        .and_then(|m| m.get_mut("content"))
        .and_then(Value::as_array_mut)
    else {
        return;
    };
    for block in blocks.iter_mut() {
        if let Some(obj) = block.as_object_mut() {
            obj.insert("cache_control".into(), json!({"type": "ephemeral"}));
        }
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn create_message(&self, request: &MessageRequest) -> Result<MessageResponse, LlmError> {
        let body = self.request_body(request)?;
        let text = self.send("/v1/messages", &body).await?;
        let response: MessageResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Decode(e.to_string()))?;
        tracing::debug!(
            id = %response.id,
            stop_reason = ?response.stop_reason,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "message created"
        );
        Ok(response)
    }

    async fn count_tokens(&self, request: &MessageRequest) -> Result<u64, LlmError> {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        let text = self.send("/v1/messages/count_tokens", &body).await?;
        let parsed: CountTokensResponse =
            serde_json::from_str(&text).map_err(|e| LlmError::Decode(e.to_string()))?;
        Ok(parsed.input_tokens)
    }
}
