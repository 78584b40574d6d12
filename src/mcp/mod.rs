//! 外部连接管理（External Connection Manager）：MCP 提供方配置、传输、连接状态机与作用域释放

pub mod config;
pub mod connection;
pub mod protocol;
pub mod scope;
pub mod sse;
pub mod transport;

pub use config::{McpServerConfig, McpServerEntry, TransportConfig, TransportKind};
pub use connection::{ConnectionState, McpConnection};
pub use scope::ConnectionScope;
pub use transport::{HttpTransport, SseTransport, StdioTransport, Transport};

use std::time::Duration;

/// 提供方连接与调用错误
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("invalid provider config: {0}")]
    Config(String),

    #[error("server spawn failed: {0}")]
    SpawnFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("timeout waiting for response to {0}")]
    Timeout(String),

    #[error("provider '{server}' is not ready (state {state:?})")]
    InvalidState {
        server: String,
        state: ConnectionState,
    },

    /// 提供方返回 isError，文本原样交给模型
    #[error("{0}")]
    ToolFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 默认的单次请求超时
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
