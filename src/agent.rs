//! 一次编排调用的运行时
//!
//! Agent 持有配置与模型客户端；每次 run 都新建连接作用域、工具注册表与历史，
//! 跑完采样循环后无论成功、出错、超时还是被取消，都会先关闭全部提供方连接再返回。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{AgentError, EventSink, SamplingSession};
use crate::llm::{AnthropicClient, LlmClient, MockLlmClient};
use crate::mcp::ConnectionScope;
use crate::memory::{ConversationTurn, History, Role};
use crate::observability::usage::{UsageLedger, UsageTotals};
use crate::tools::{CalculatorTool, FileReadTool, FileWriteTool, ThinkTool, ToolRegistry};

/// 一次调用的结果
#[derive(Debug, Clone)]
pub struct RunResult {
    /// 最后一轮助手文本
    pub reply: String,
    /// 完整对话记录（含截断后的历史）
    pub turns: Vec<ConversationTurn>,
    pub iterations: usize,
    pub usage: UsageTotals,
}

pub struct Agent {
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    events: EventSink,
}

impl Agent {
    pub fn new(config: AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            config,
            llm,
            events: EventSink::none(),
        }
    }

    /// 按 [llm].provider 构建模型客户端
    pub fn from_config(config: AppConfig) -> Result<Self, AgentError> {
        let llm = create_llm_from_config(&config)?;
        Ok(Self::new(config, llm))
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 按 [tools].enabled 注册本地工具；未知名字只告警
    pub fn local_tools(&self) -> Result<ToolRegistry, AgentError> {
        let root = match &self.config.tools.filesystem_root {
            Some(root) => root.clone(),
            None => std::env::current_dir()
                .map_err(|e| AgentError::ConfigError(format!("cannot resolve working directory: {}", e)))?,
        };

        let mut registry = ToolRegistry::new();
        for name in &self.config.tools.enabled {
            match name.as_str() {
                "think" => registry.register_tool(ThinkTool),
                "calculator" => registry.register_tool(CalculatorTool),
                "file_read" => registry.register_tool(FileReadTool::new(&root)),
                "file_write" => registry.register_tool(FileWriteTool::new(&root)),
                other => tracing::warn!(tool = %other, "unknown local tool in [tools].enabled, skipped"),
            }
        }
        Ok(registry)
    }

    /// 跑一次调用；配置了 [app].run_timeout_secs 时受其约束
    pub async fn run(&self, prompt: &str) -> Result<RunResult, AgentError> {
        match self.config.run_timeout() {
            Some(limit) => self.run_with_timeout(prompt, limit).await,
            None => self.run_guarded(prompt, std::future::pending()).await,
        }
    }

    /// 整体超时：到点后放弃在途的模型请求与工具调用，关闭连接并返回 Timeout
    pub async fn run_with_timeout(&self, prompt: &str, limit: Duration) -> Result<RunResult, AgentError> {
        self.run_guarded(prompt, async move {
            tokio::time::sleep(limit).await;
            tracing::warn!(timeout_secs = limit.as_secs_f64(), "run timed out");
            AgentError::Timeout(limit)
        })
        .await
    }

    /// 调用方取消：token 触发后同超时一样拆除
    pub async fn run_until_cancelled(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<RunResult, AgentError> {
        self.run_guarded(prompt, async move {
            cancel.cancelled().await;
            tracing::info!("run cancelled by caller");
            AgentError::Cancelled
        })
        .await
    }

    async fn run_guarded<S>(&self, prompt: &str, stop: S) -> Result<RunResult, AgentError>
    where
        S: Future<Output = AgentError>,
    {
        let mut scope = ConnectionScope::new(self.events.clone());
        let result = {
            let inner = self.run_in_scope(&mut scope, prompt);
            tokio::select! {
                biased;
                e = stop => Err(e),
                r = inner => r,
            }
        };
        // 关闭错误只记录，不覆盖 result
        scope.close_all().await;
        result
    }

    async fn run_in_scope(&self, scope: &mut ConnectionScope, prompt: &str) -> Result<RunResult, AgentError> {
        let mut registry = self.local_tools()?;
        let remote = scope.open_all(&self.config.mcp_servers).await;
        registry.extend(remote);
        tracing::info!(tools = ?registry.tool_names(), "tool set ready");

        let settings = self.config.sampling_settings();
        let executor = self.config.tool_executor();
        let usage = UsageLedger::new();
        let session = SamplingSession::new(self.llm.as_ref(), &registry, &executor, &settings)
            .with_retry(self.config.retry_policy())
            .with_events(self.events.clone())
            .with_usage(&usage);

        let baseline = session.measure_baseline().await;
        let mut history = History::new(self.config.model.context_window_tokens).with_baseline(baseline);
        history.add_text(Role::User, prompt);

        let outcome = session.run(&mut history).await?;
        Ok(RunResult {
            reply: outcome.reply,
            turns: history.into_turns(),
            iterations: outcome.iterations,
            usage: usage.totals(),
        })
    }
}

/// 根据配置创建模型客户端：anthropic / mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Result<Arc<dyn LlmClient>, AgentError> {
    match cfg.llm.provider.as_str() {
        "mock" => Ok(Arc::new(MockLlmClient::new())),
        "anthropic" => {
            let mut client = AnthropicClient::new(
                cfg.llm.api_key.as_deref(),
                Duration::from_secs(cfg.llm.timeouts.request),
            )?
            .with_api_version(cfg.llm.api_version.clone())
            .with_betas(cfg.llm.betas.clone())
            .with_prompt_caching(cfg.llm.prompt_caching);
            if let Some(url) = &cfg.llm.base_url {
                client = client.with_base_url(url.clone());
            }
            Ok(Arc::new(client))
        }
        other => Err(AgentError::ConfigError(format!("unknown llm provider: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::{text_reply, tool_reply};
    use crate::mcp::{McpServerConfig, McpServerEntry};
    use crate::memory::{ContentBlock, ToolResultContent};
    use serde_json::json;

    fn mock_config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "mock".to_string();
        cfg.tools.enabled = vec!["think".to_string(), "calculator".to_string()];
        cfg
    }

    #[tokio::test]
    async fn test_run_with_local_tools() {
        let mock = Arc::new(MockLlmClient::scripted(vec![
            Ok(tool_reply(&[("c1", "calculator", json!({"number1": 6, "number2": 7, "operator": "*"}))])),
            Ok(text_reply("42")),
        ]));
        let agent = Agent::new(mock_config(), mock.clone());
        let result = agent.run("what is 6 * 7?").await.unwrap();

        assert_eq!(result.reply, "42");
        assert_eq!(result.iterations, 2);
        // user, assistant(tool_use), tool_result, assistant
        assert_eq!(result.turns.len(), 4);
        assert_eq!(result.turns[2].role, Role::ToolResult);
        match &result.turns[2].content[0] {
            ContentBlock::ToolResult { tool_use_id, content, is_error } => {
                assert_eq!(tool_use_id, "c1");
                assert!(!is_error);
                assert_eq!(content, &vec![ToolResultContent::Text { text: "Result: 42".into() }]);
            }
            other => panic!("unexpected block: {:?}", other),
        }
        assert_eq!(result.usage.calls, 2);
    }

    #[tokio::test]
    async fn test_unknown_enabled_tool_is_skipped() {
        let mut cfg = mock_config();
        cfg.tools.enabled.push("teleport".to_string());
        let agent = Agent::new(cfg, Arc::new(MockLlmClient::new()));
        let registry = agent.local_tools().unwrap();
        assert_eq!(registry.tool_names(), vec!["think", "calculator"]);
    }

    #[tokio::test]
    async fn test_failed_provider_does_not_abort_run() {
        let mut cfg = mock_config();
        cfg.mcp_servers = vec![
            McpServerConfig::stdio("/nonexistent/hive-provider", vec![]).into(),
            McpServerEntry {
                name: Some("no-command".into()),
                ..Default::default()
            },
        ];
        let agent = Agent::new(cfg, Arc::new(MockLlmClient::scripted(vec![Ok(text_reply("done"))])));
        let result = agent.run("hi").await.unwrap();
        assert_eq!(result.reply, "done");
    }

    #[tokio::test]
    async fn test_cancelled_run() {
        let token = CancellationToken::new();
        token.cancel();
        let agent = Agent::new(mock_config(), Arc::new(MockLlmClient::new()));
        let err = agent.run_until_cancelled("hi", token).await.unwrap_err();
        assert!(matches!(err, AgentError::Cancelled));
    }

    #[test]
    fn test_unknown_provider() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "nope".to_string();
        assert!(matches!(Agent::from_config(cfg), Err(AgentError::ConfigError(_))));
    }
}
