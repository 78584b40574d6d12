//! 工具注册表
//!
//! 本地工具实现 Tool trait；外部提供方的工具以代理形式接入。两者统一为 ToolHandler 枚举，
//! 由 ToolRegistry 按名注册（同名替换，仅在本次调用的活动集合内生效）并生成声明给模型的工具清单。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::llm::ToolSpec;
use crate::mcp::McpConnection;
use crate::memory::ImageSource;

/// 工具执行结果：文本 + 可选图片
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    pub image: Option<ImageSource>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: ImageSource) -> Self {
        self.image = Some(image);
        self
    }
}

impl From<String> for ToolOutput {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

/// 本地工具 trait：名称、描述（供 LLM 理解）、输入 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 输入 JSON Schema，默认不限参数
    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
        })
    }

    /// 执行工具；Err 中的文本会原样反馈给模型
    async fn execute(&self, args: Value) -> Result<ToolOutput, String>;
}

/// 工具处理器：本地函数，或经外部连接代理
#[derive(Clone)]
pub enum ToolHandler {
    Local(Arc<dyn Tool>),
    Proxy {
        connection: Arc<McpConnection>,
        /// 提供方侧的工具名
        remote_name: String,
    },
}

impl ToolHandler {
    pub async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        match self {
            ToolHandler::Local(tool) => tool.execute(args).await,
            ToolHandler::Proxy {
                connection,
                remote_name,
            } => connection
                .call(remote_name, args)
                .await
                .map(ToolOutput::text)
                .map_err(|e| e.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ToolHandler::Local(_) => "local",
            ToolHandler::Proxy { .. } => "proxy",
        }
    }
}

impl fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolHandler::Local(tool) => f.debug_tuple("Local").field(&tool.name()).finish(),
            ToolHandler::Proxy {
                connection,
                remote_name,
            } => f
                .debug_struct("Proxy")
                .field("server", &connection.name())
                .field("remote_name", remote_name)
                .finish(),
        }
    }
}

/// 工具描述：名称、描述、输入 schema、处理器
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub handler: ToolHandler,
}

impl ToolDescriptor {
    pub fn local(tool: impl Tool + 'static) -> Self {
        Self::from_arc(Arc::new(tool))
    }

    pub fn from_arc(tool: Arc<dyn Tool>) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            input_schema: tool.input_schema(),
            handler: ToolHandler::Local(tool),
        }
    }

    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
        }
    }
}

/// 工具注册表：保持注册顺序，按名索引；同名注册替换先前条目
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, descriptor: ToolDescriptor) {
        match self.index.get(&descriptor.name) {
            Some(&i) => {
                tracing::warn!(
                    tool = %descriptor.name,
                    previous = self.tools[i].handler.kind(),
                    replacement = descriptor.handler.kind(),
                    "tool name collision, replacing previous entry"
                );
                self.tools[i] = descriptor;
            }
            None => {
                self.index.insert(descriptor.name.clone(), self.tools.len());
                self.tools.push(descriptor);
            }
        }
    }

    pub fn register_tool(&mut self, tool: impl Tool + 'static) {
        self.register(ToolDescriptor::local(tool));
    }

    pub fn extend(&mut self, descriptors: impl IntoIterator<Item = ToolDescriptor>) {
        for d in descriptors {
            self.register(d);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// 声明给模型的工具清单（注册顺序）
    pub fn manifest(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(ToolDescriptor::spec).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str, &'static str);

    #[async_trait]
    impl Tool for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "fixed reply"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::text(self.1))
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(Fixed("a", "one"));
        registry.register_tool(Fixed("b", "two"));
        assert_eq!(registry.tool_names(), vec!["a", "b"]);
        let out = registry.get("b").unwrap().handler.execute(Value::Null).await.unwrap();
        assert_eq!(out.text, "two");
        assert!(registry.get("c").is_none());
    }

    #[tokio::test]
    async fn test_collision_replaces_in_place() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(Fixed("a", "old"));
        registry.register_tool(Fixed("b", "x"));
        registry.register_tool(Fixed("a", "new"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.tool_names(), vec!["a", "b"]);
        let out = registry.get("a").unwrap().handler.execute(Value::Null).await.unwrap();
        assert_eq!(out.text, "new");
    }

    #[test]
    fn test_manifest_shape() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(Fixed("a", "one"));
        let manifest = registry.manifest();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].name, "a");
        assert_eq!(manifest[0].input_schema["type"], "object");
    }
}
