//! Agent 错误类型与恢复动作
//!
//! 与 Backoff 配合：限流类错误给出 RetryAfter，其余远端错误立即 Abort。

use std::time::Duration;

use thiserror::Error;

use crate::llm::LlmError;

/// 一次编排调用可能的失败
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("rate limited after {attempts} attempts: {message}")]
    RateLimitExhausted { attempts: u32, message: String },

    #[error("run timed out after {0:?}")]
    Timeout(Duration),

    #[error("run cancelled")]
    Cancelled,

    #[error("iteration limit reached ({0})")]
    IterationLimit(usize),

    #[error("Config error: {0}")]
    ConfigError(String),
}

/// Backoff 根据错误给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 等待后原样重试同一请求
    RetryAfter(Duration),
    /// 终止循环并向上传播
    Abort,
}
