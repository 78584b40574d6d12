//! 外部工具提供方连接
//!
//! 状态机 Idle → Connecting → Ready → Closing → Closed；列出 / 调用工具只在 Ready 有效。
//! open 完成 initialize 握手与 tools/list，把提供方工具翻译为代理 ToolDescriptor；
//! close 幂等且尽力而为。

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::watch;

use crate::mcp::config::{McpServerConfig, TransportKind};
use crate::mcp::protocol::{
    InitializeParams, ListToolsResult, McpToolDefinition, ToolCallParams, ToolCallResult,
};
use crate::mcp::transport::{self, Transport};
use crate::mcp::McpError;
use crate::tools::{ToolDescriptor, ToolHandler};

/// 连接生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Ready,
    Closing,
    Closed,
}

/// 一条到外部提供方的连接；只属于打开它的那次编排调用
pub struct McpConnection {
    name: String,
    kind: TransportKind,
    config: Option<McpServerConfig>,
    state: watch::Sender<ConnectionState>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    tools: Mutex<Vec<McpToolDefinition>>,
}

impl std::fmt::Debug for McpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpConnection")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl McpConnection {
    pub fn new(config: McpServerConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            name: config.name.clone(),
            kind: config.kind(),
            config: Some(config),
            state,
            transport: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
        }
    }

    /// 使用已建立的传输（测试或自定义传输）
    pub fn with_transport(name: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            name: name.into(),
            kind: transport.kind(),
            config: None,
            state,
            transport: Mutex::new(Some(transport)),
            tools: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 提供方声明的工具（Ready 之后有效）
    pub fn tool_definitions(&self) -> Vec<McpToolDefinition> {
        self.tools.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// 仅当当前状态在 from 中时迁移到 to
    fn transition(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.state.send_if_modified(|s| {
            if from.contains(s) {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.lock().ok().and_then(|t| t.clone())
    }

    fn ready_transport(&self) -> Result<Arc<dyn Transport>, McpError> {
        let state = self.state();
        if state != ConnectionState::Ready {
            return Err(McpError::InvalidState {
                server: self.name.clone(),
                state,
            });
        }
        self.current_transport().ok_or_else(|| McpError::InvalidState {
            server: self.name.clone(),
            state,
        })
    }

    /// 建立传输、握手并列出工具；失败时连接会被关闭（到达 Closed）
    pub async fn open(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        if !self.transition(&[ConnectionState::Idle], ConnectionState::Connecting) {
            return Err(McpError::InvalidState {
                server: self.name.clone(),
                state: self.state(),
            });
        }
        match self.handshake().await {
            Ok(tools) => {
                if !self.transition(&[ConnectionState::Connecting], ConnectionState::Ready) {
                    // 握手期间被关闭
                    return Err(McpError::InvalidState {
                        server: self.name.clone(),
                        state: self.state(),
                    });
                }
                tracing::info!(server = %self.name, transport = %self.kind, tools = tools.len(), "provider ready");
                Ok(tools)
            }
            Err(e) => {
                if let Err(close_err) = self.close().await {
                    tracing::debug!(server = %self.name, error = %close_err, "cleanup after failed open");
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let transport = match self.current_transport() {
            Some(t) => t,
            None => {
                let config = self
                    .config
                    .as_ref()
                    .ok_or_else(|| McpError::Config("connection has no transport".into()))?;
                let t = transport::connect(config).await?;
                if let Ok(mut slot) = self.transport.lock() {
                    *slot = Some(t.clone());
                }
                t
            }
        };

        let init = transport
            .request(
                "initialize",
                Some(serde_json::to_value(InitializeParams::for_client())?),
            )
            .await?;
        tracing::debug!(
            server = %self.name,
            server_info = %init.get("serverInfo").cloned().unwrap_or(serde_json::Value::Null),
            "provider initialized"
        );
        transport.notify("notifications/initialized", None).await?;

        let listed: ListToolsResult = serde_json::from_value(transport.request("tools/list", None).await?)
            .map_err(|e| McpError::Protocol(format!("failed to parse tools list: {e}")))?;
        if let Ok(mut tools) = self.tools.lock() {
            *tools = listed.tools.clone();
        }
        Ok(listed.tools)
    }

    /// 调用提供方工具，返回第一段文本；isError 结果转为 ToolFailed
    pub async fn call(&self, tool_name: &str, args: Value) -> Result<String, McpError> {
        let transport = self.ready_transport()?;
        let params = ToolCallParams {
            name: tool_name,
            arguments: args,
        };
        let raw = transport
            .request("tools/call", Some(serde_json::to_value(&params)?))
            .await?;
        let result: ToolCallResult = serde_json::from_value(raw)
            .map_err(|e| McpError::Protocol(format!("invalid tools/call result: {e}")))?;
        if result.is_error {
            return Err(McpError::ToolFailed(result.first_text()));
        }
        Ok(result.first_text())
    }

    /// 幂等关闭：已在 Closing / Closed 时直接返回 Ok；传输关闭错误返回给调用方，但状态总会到达 Closed
    pub async fn close(&self) -> Result<(), McpError> {
        if self.transition(&[ConnectionState::Idle], ConnectionState::Closed) {
            return Ok(());
        }
        if !self.transition(
            &[ConnectionState::Connecting, ConnectionState::Ready],
            ConnectionState::Closing,
        ) {
            return Ok(());
        }
        let transport = self.transport.lock().ok().and_then(|mut t| t.take());
        let result = match transport {
            Some(t) => t.close().await,
            None => Ok(()),
        };
        self.state.send_replace(ConnectionState::Closed);
        tracing::debug!(server = %self.name, "provider closed");
        result
    }

    /// 同步中止（Drop 路径）：不等待，直接到达 Closed
    pub fn abort(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        if let Some(t) = self.transport.lock().ok().and_then(|mut t| t.take()) {
            t.abort();
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    /// 把提供方工具翻译为代理描述（处理器经本连接转发调用）
    pub fn tool_descriptors(self: &Arc<Self>) -> Vec<ToolDescriptor> {
        self.tool_definitions()
            .into_iter()
            .map(|def| ToolDescriptor {
                description: def.description_or_default(),
                input_schema: def.input_schema.clone(),
                handler: ToolHandler::Proxy {
                    connection: Arc::clone(self),
                    remote_name: def.name.clone(),
                },
                name: def.name,
            })
            .collect()
    }
}
