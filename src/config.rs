//! 应用配置：从 config/default.toml、显式配置文件与环境变量加载
//!
//! 加载顺序：先读默认 TOML 文件，再读 --config 指定的文件，最后用环境变量 `HIVE__*` 覆盖
//! （双下划线表示嵌套，如 `HIVE__MODEL__MAX_TOKENS=8192`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::core::{RetryPolicy, SamplingSettings};
use crate::mcp::McpServerEntry;
use crate::memory::MediaRetention;
use crate::tools::{DispatchMode, ToolExecutor};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub model: ModelSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub history: HistorySection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub tools: ToolsSection,
    /// [[mcp_servers]]：外部工具提供方（打开时逐个校验）
    #[serde(default)]
    pub mcp_servers: Vec<McpServerEntry>,
}

/// [app] 段：应用名、system prompt、循环上限与整体超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub system_prompt: String,
    /// 最多迭代轮数，未设置表示不限
    pub max_iterations: Option<usize>,
    /// 单次调用整体超时（秒），未设置表示不限
    pub run_timeout_secs: Option<u64>,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
            max_iterations: None,
            run_timeout_secs: None,
        }
    }
}

/// [model] 段：模型与请求参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub context_window_tokens: u64,
    /// 供应商特定参数（如 top_k、metadata），原样合并进请求体
    pub params: Map<String, Value>,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            name: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            temperature: 1.0,
            context_window_tokens: 180_000,
            params: Map::new(),
        }
    }
}

/// [llm] 段：后端选择、鉴权与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// anthropic / mock
    pub provider: String,
    pub base_url: Option<String>,
    /// 未设置时读 ANTHROPIC_API_KEY
    pub api_key: Option<String>,
    pub api_version: String,
    pub betas: Vec<String>,
    pub prompt_caching: bool,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            base_url: None,
            api_key: None,
            api_version: crate::llm::anthropic::DEFAULT_API_VERSION.to_string(),
            betas: Vec::new(),
            prompt_caching: true,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次请求超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 120 }
    }
}

/// [history] 段：图片保留与 token 校准
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// 只保留最近 N 张图片，未设置表示不剥离
    pub only_n_most_recent_images: Option<usize>,
    /// 图片按该批次大小整批剥离
    pub image_removal_batch: usize,
    /// 每 N 轮远端计数一次，0 关闭
    pub token_count_interval: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            only_n_most_recent_images: None,
            image_removal_batch: 10,
            token_count_interval: 0,
        }
    }
}

/// [retry] 段：限流退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: Option<u32>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
            max_attempts: None,
        }
    }
}

/// [tools] 段：文件系统根、工具超时、调度模式、启用的本地工具
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 文件工具的沙箱根目录，未设置时用当前目录
    pub filesystem_root: Option<PathBuf>,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub dispatch: DispatchMode,
    /// 启用的本地工具名：think / calculator / file_read / file_write
    pub enabled: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            filesystem_root: None,
            tool_timeout_secs: 30,
            dispatch: DispatchMode::Concurrent,
            enabled: ["think", "calculator", "file_read", "file_write"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl AppConfig {
    pub fn sampling_settings(&self) -> SamplingSettings {
        SamplingSettings {
            model: self.model.name.clone(),
            max_tokens: self.model.max_tokens,
            temperature: self.model.temperature,
            system_prompt: self.app.system_prompt.clone(),
            params: self.model.params.clone(),
            media: self
                .history
                .only_n_most_recent_images
                .map(|n| MediaRetention::new(n, self.history.image_removal_batch)),
            token_count_interval: self.history.token_count_interval,
            max_iterations: self.app.max_iterations,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn tool_executor(&self) -> ToolExecutor {
        ToolExecutor::new(
            Duration::from_secs(self.tools.tool_timeout_secs),
            self.tools.dispatch,
        )
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.app.run_timeout_secs.map(Duration::from_secs)
    }
}

/// 加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（必须存在，可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(path) = config_path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::TransportKind;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.model.max_tokens, 4096);
        assert_eq!(cfg.model.temperature, 1.0);
        assert_eq!(cfg.model.context_window_tokens, 180_000);
        assert_eq!(cfg.retry_policy().base_delay, Duration::from_secs(2));
        assert_eq!(cfg.retry_policy().max_delay, Duration::from_secs(60));
        assert!(cfg.sampling_settings().media.is_none());
        assert_eq!(cfg.tools.enabled.len(), 4);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[app]
system_prompt = "be brief"
max_iterations = 8

[model]
name = "test-model"
max_tokens = 1024
params = {{ top_k = 5 }}

[history]
only_n_most_recent_images = 3

[tools]
dispatch = "sequential"

[[mcp_servers]]
name = "calc"
command = "hive-calculator"

[[mcp_servers]]
type = "sse"
url = "http://localhost:9000/sse"

[[mcp_servers]]
name = "broken"
type = "stdio"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.app.system_prompt, "be brief");
        assert_eq!(cfg.app.max_iterations, Some(8));
        assert_eq!(cfg.model.name, "test-model");
        assert_eq!(cfg.model.temperature, 1.0);
        assert_eq!(cfg.model.params["top_k"], 5);
        let settings = cfg.sampling_settings();
        assert_eq!(settings.media, Some(MediaRetention::new(3, 10)));
        assert_eq!(cfg.tools.dispatch, DispatchMode::Sequential);
        // 写错的条目不影响加载，留到打开时报告
        assert_eq!(cfg.mcp_servers.len(), 3);
        assert_eq!(cfg.mcp_servers[0].validate().unwrap().kind(), TransportKind::Stdio);
        assert_eq!(cfg.mcp_servers[1].validate().unwrap().kind(), TransportKind::Sse);
        assert!(cfg.mcp_servers[2].validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(load_config(Some(PathBuf::from("/nonexistent/hive.toml"))).is_err());
    }
}
