//! 连接作用域：一次编排调用打开的全部连接都登记在此，任何退出路径上都会被关闭
//!
//! close_all 逆序关闭并吞掉（记录）关闭错误；未经 close_all 就被丢弃时，Drop 同步中止剩余连接。

use std::sync::Arc;

use crate::core::events::{EventSink, LoopEvent};
use crate::mcp::{ConnectionState, McpConnection, McpServerEntry};
use crate::tools::ToolDescriptor;

#[derive(Debug, Default)]
pub struct ConnectionScope {
    connections: Vec<Arc<McpConnection>>,
    events: EventSink,
}

impl ConnectionScope {
    pub fn new(events: EventSink) -> Self {
        Self {
            connections: Vec::new(),
            events,
        }
    }

    /// 登记一个连接（打开之前登记，保证失败路径也会被释放）
    pub fn track(&mut self, connection: Arc<McpConnection>) -> Arc<McpConnection> {
        self.connections.push(Arc::clone(&connection));
        connection
    }

    /// 打开并登记一个连接，返回其工具描述
    pub async fn open(&mut self, connection: Arc<McpConnection>) -> Result<Vec<ToolDescriptor>, crate::mcp::McpError> {
        let connection = self.track(connection);
        match connection.open().await {
            Ok(_) => {
                let descriptors = connection.tool_descriptors();
                self.events.emit(LoopEvent::ProviderConnected {
                    server: connection.name().to_string(),
                    transport: connection.kind().to_string(),
                    tools: descriptors.iter().map(|d| d.name.clone()).collect(),
                });
                Ok(descriptors)
            }
            Err(e) => {
                tracing::warn!(server = %connection.name(), error = %e, "failed to open provider, its tools are skipped");
                self.events.emit(LoopEvent::ProviderFailed {
                    server: connection.name().to_string(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// 尽力打开全部配置的提供方：单个失败只记录，不影响其余
    pub async fn open_all(&mut self, entries: &[McpServerEntry]) -> Vec<ToolDescriptor> {
        let mut merged = Vec::new();
        for entry in entries {
            let config = match entry.validate() {
                Ok(config) => config,
                Err(e) => {
                    let server = entry.display_name();
                    tracing::warn!(server = %server, error = %e, "invalid provider entry, skipped");
                    self.events.emit(LoopEvent::ProviderFailed {
                        server,
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            let connection = Arc::new(McpConnection::new(config));
            if let Ok(descriptors) = self.open(connection).await {
                merged.extend(descriptors);
            }
        }
        tracing::info!(
            tools = merged.len(),
            servers = entries.len(),
            "loaded provider tools"
        );
        merged
    }

    /// 逆序关闭全部连接；关闭错误只记录
    pub async fn close_all(&mut self) {
        for connection in self.connections.iter().rev() {
            if connection.state() == ConnectionState::Closed {
                continue;
            }
            if let Err(e) = connection.close().await {
                tracing::warn!(server = %connection.name(), error = %e, "provider close failed");
            }
            self.events.emit(LoopEvent::ProviderClosed {
                server: connection.name().to_string(),
            });
        }
    }

    pub fn all_closed(&self) -> bool {
        self.connections
            .iter()
            .all(|c| c.state() == ConnectionState::Closed)
    }
}

impl Drop for ConnectionScope {
    fn drop(&mut self) {
        for connection in self.connections.iter().rev() {
            if connection.state() != ConnectionState::Closed {
                tracing::warn!(server = %connection.name(), "provider not closed before scope drop, aborting");
                connection.abort();
            }
        }
    }
}
