//! LLM 层：客户端抽象与实现（Anthropic Messages API / Mock）

pub mod anthropic;
pub mod mock;
pub mod traits;
pub mod types;

pub use anthropic::AnthropicClient;
pub use mock::MockLlmClient;
pub use traits::LlmClient;
pub use types::{LlmError, MessageRequest, MessageResponse, ToolInvocation, ToolSpec};
