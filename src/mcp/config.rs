//! 外部工具提供方配置
//!
//! 每个 [[mcp_servers]] 条目按 type 选择传输：stdio（子进程：command + args + env）、
//! sse（GET 建立事件流，按 endpoint 事件 POST 请求）或 http / stream（Streamable HTTP）。type 缺省为 stdio。
//!
//! 条目先以原始形态（McpServerEntry）读入，打开连接时才逐个校验，
//! 因此单个写错的条目只会让该提供方失败，不影响配置加载和其他提供方。

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::mcp::McpError;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = crate::mcp::DEFAULT_REQUEST_TIMEOUT.as_secs();

/// 传输种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// 子进程管道
    Stdio,
    /// 持久事件流（GET 流 + endpoint POST）
    Sse,
    /// Streamable HTTP（每个请求一次 POST，响应为 JSON 或 SSE）
    Stream,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Stdio => f.write_str("stdio"),
            TransportKind::Sse => f.write_str("sse"),
            TransportKind::Stream => f.write_str("stream"),
        }
    }
}

/// 传输相关字段
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    Stdio {
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        headers: HashMap<String, String>,
    },
    Stream {
        url: String,
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Sse { .. } => TransportKind::Sse,
            TransportConfig::Stream { .. } => TransportKind::Stream,
        }
    }
}

/// 校验后的单个提供方配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: TransportConfig,
    pub request_timeout: Duration,
}

impl McpServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        let command = command.into();
        Self {
            name: command.clone(),
            transport: TransportConfig::Stdio {
                command,
                args,
                env: HashMap::new(),
            },
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn sse(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: url.clone(),
            transport: TransportConfig::Sse {
                url,
                headers: HashMap::new(),
            },
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn stream(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            name: url.clone(),
            transport: TransportConfig::Stream {
                url,
                headers: HashMap::new(),
            },
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

/// 配置文件中的原始条目（未校验）
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct McpServerEntry {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl McpServerEntry {
    /// 用于日志与事件的名字：name，否则 command / url
    pub fn display_name(&self) -> String {
        [&self.name, &self.command, &self.url]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .cloned()
            .unwrap_or_else(|| "<unnamed>".to_string())
    }

    pub fn validate(&self) -> Result<McpServerConfig, McpError> {
        McpServerConfig::try_from(self.clone())
    }
}

impl From<McpServerConfig> for McpServerEntry {
    fn from(config: McpServerConfig) -> Self {
        let mut entry = McpServerEntry {
            name: Some(config.name),
            request_timeout_secs: Some(config.request_timeout.as_secs()),
            ..Default::default()
        };
        match config.transport {
            TransportConfig::Stdio { command, args, env } => {
                entry.kind = Some("stdio".to_string());
                entry.command = Some(command);
                entry.args = args;
                entry.env = env;
            }
            TransportConfig::Sse { url, headers } => {
                entry.kind = Some("sse".to_string());
                entry.url = Some(url);
                entry.headers = headers;
            }
            TransportConfig::Stream { url, headers } => {
                entry.kind = Some("stream".to_string());
                entry.url = Some(url);
                entry.headers = headers;
            }
        }
        entry
    }
}

impl TryFrom<McpServerEntry> for McpServerConfig {
    type Error = McpError;

    fn try_from(raw: McpServerEntry) -> Result<Self, Self::Error> {
        let kind = raw.kind.as_deref().unwrap_or("stdio").to_lowercase();
        let transport = match kind.as_str() {
            "stdio" => {
                let command = raw
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or_else(|| McpError::Config("command is required for stdio connections".into()))?;
                TransportConfig::Stdio {
                    command,
                    args: raw.args,
                    env: raw.env,
                }
            }
            "sse" | "http" | "stream" => {
                let url = raw
                    .url
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| McpError::Config(format!("url is required for {kind} connections")))?;
                if kind == "sse" {
                    TransportConfig::Sse {
                        url,
                        headers: raw.headers,
                    }
                } else {
                    TransportConfig::Stream {
                        url,
                        headers: raw.headers,
                    }
                }
            }
            other => {
                return Err(McpError::Config(format!(
                    "unsupported connection type: {}",
                    other
                )))
            }
        };
        let name = raw.name.filter(|n| !n.is_empty()).unwrap_or_else(|| match &transport {
            TransportConfig::Stdio { command, .. } => command.clone(),
            TransportConfig::Sse { url, .. } | TransportConfig::Stream { url, .. } => url.clone(),
        });
        Ok(Self {
            name,
            transport,
            request_timeout: Duration::from_secs(
                raw.request_timeout_secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: serde_json::Value) -> Result<McpServerConfig, McpError> {
        serde_json::from_value::<McpServerEntry>(value).unwrap().validate()
    }

    #[test]
    fn test_type_defaults_to_stdio() {
        let cfg = parse(json!({"command": "python", "args": ["calc.py"]})).unwrap();
        assert_eq!(cfg.kind(), TransportKind::Stdio);
        assert_eq!(cfg.name, "python");
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_sse_and_stream_kinds() {
        let err = parse(json!({"type": "sse"})).unwrap_err();
        assert!(err.to_string().contains("url is required for sse"));
        let cfg = parse(json!({
            "type": "SSE",
            "name": "remote",
            "url": "http://localhost:8080/sse",
            "headers": {"Authorization": "Bearer t"}
        }))
        .unwrap();
        assert_eq!(cfg.kind(), TransportKind::Sse);
        assert_eq!(cfg.name, "remote");

        for kind in ["http", "stream"] {
            let cfg = parse(json!({"type": kind, "url": "http://localhost:8080/mcp"})).unwrap();
            assert_eq!(cfg.kind(), TransportKind::Stream);
            assert_eq!(cfg.name, "http://localhost:8080/mcp");
        }
    }

    #[test]
    fn test_rejects_missing_command_and_unknown_type() {
        assert!(parse(json!({"type": "stdio"})).is_err());
        let err = parse(json!({"type": "ws", "url": "x"})).unwrap_err();
        assert!(err.to_string().contains("unsupported connection type"));
    }

    #[test]
    fn test_display_name_falls_back() {
        let entry: McpServerEntry = serde_json::from_value(json!({"type": "stdio"})).unwrap();
        assert_eq!(entry.display_name(), "<unnamed>");
        let entry: McpServerEntry = serde_json::from_value(json!({"name": "bad", "type": "stdio"})).unwrap();
        assert_eq!(entry.display_name(), "bad");
    }

    #[test]
    fn test_entry_from_config_validates_back() {
        let cfg = McpServerConfig::stream("http://localhost:1/mcp")
            .with_name("s")
            .with_request_timeout(Duration::from_secs(5));
        assert_eq!(McpServerEntry::from(cfg.clone()).validate().unwrap(), cfg);
        let cfg = McpServerConfig::stdio("calc", vec!["--x".into()]);
        assert_eq!(McpServerEntry::from(cfg.clone()).validate().unwrap(), cfg);
    }
}
