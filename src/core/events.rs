//! 采样循环过程事件：供前端（终端 / 机器人）展示助手文本、工具调用、退避与连接生命周期

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    /// 外部工具提供方已就绪
    ProviderConnected {
        server: String,
        transport: String,
        tools: Vec<String>,
    },
    /// 提供方连接失败（其工具不会出现在本次注册表中）
    ProviderFailed { server: String, error: String },
    /// 提供方已关闭
    ProviderClosed { server: String },
    /// 新一轮迭代开始
    Iteration { iteration: usize },
    /// 历史被截断
    HistoryTruncated { removed_turns: usize, tokens_after: u64 },
    /// 限流退避
    RateLimited {
        attempt: u32,
        delay_ms: u64,
        message: String,
    },
    /// 单次模型调用的 token 用量
    Usage {
        iteration: usize,
        input_tokens: u64,
        output_tokens: u64,
        cache_read_input_tokens: u64,
        cache_creation_input_tokens: u64,
    },
    /// 助手文本
    AssistantText { text: String },
    /// 模型请求调用工具
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// 工具结果（预览，避免过长）
    ToolResult {
        id: String,
        is_error: bool,
        preview: String,
    },
    /// 循环结束（没有更多工具调用）
    Finished { iterations: usize },
}

/// 可选事件通道；接收端已关闭时静默丢弃
#[derive(Debug, Clone, Default)]
pub struct EventSink(Option<UnboundedSender<LoopEvent>>);

impl EventSink {
    pub fn new(tx: UnboundedSender<LoopEvent>) -> Self {
        Self(Some(tx))
    }

    pub fn none() -> Self {
        Self(None)
    }

    pub fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

impl From<Option<UnboundedSender<LoopEvent>>> for EventSink {
    fn from(tx: Option<UnboundedSender<LoopEvent>>) -> Self {
        Self(tx)
    }
}

/// 截取前 n 个字符作为预览
pub fn preview(text: &str, n: usize) -> String {
    if text.chars().count() > n {
        format!("{}...", text.chars().take(n).collect::<String>())
    } else {
        text.to_string()
    }
}
