//! 采样编排器（Sampling Orchestrator）：主控循环
//!
//! 每轮：(a) 剥离旧图片并截断历史 (b) 由配置、历史与工具清单组装请求 (c) 发送（限流时退避重试同一请求）
//! (d) 追加助手轮 (e) 没有工具调用则结束，否则调度全部调用，追加一条聚合的工具结果轮后继续。

use std::time::Duration;

use serde_json::{Map, Value};

use crate::core::events::{preview, EventSink, LoopEvent};
use crate::core::recovery::{Backoff, RetryPolicy};
use crate::core::{AgentError, RecoveryAction};
use crate::llm::{LlmClient, LlmError, MessageRequest, MessageResponse};
use crate::memory::{ContentBlock, History, MediaRetention, Role, TokenEstimator, WireMessage, WireRole};
use crate::observability::UsageLedger;
use crate::tools::{ToolExecutor, ToolRegistry};

/// 请求组装与循环控制参数
#[derive(Debug, Clone)]
pub struct SamplingSettings {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
    /// 供应商特定参数，平铺进请求体
    pub params: Map<String, Value>,
    /// None 表示不剥离图片
    pub media: Option<MediaRetention>,
    /// 每 N 轮用远端计数校准一次账本，0 表示关闭
    pub token_count_interval: usize,
    /// None 表示不限轮数
    pub max_iterations: Option<usize>,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            temperature: 1.0,
            system_prompt: String::new(),
            params: Map::new(),
            media: None,
            token_count_interval: 0,
            max_iterations: None,
        }
    }
}

/// 循环终态
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingOutcome {
    /// 最后一轮助手文本
    pub reply: String,
    pub iterations: usize,
}

/// 单次采样会话：借用本次调用的各个部件
pub struct SamplingSession<'a> {
    /// 远端模型（必需）
    pub llm: &'a dyn LlmClient,
    /// 活动工具集（必需）
    pub registry: &'a ToolRegistry,
    /// 工具执行器（必需）
    pub executor: &'a ToolExecutor,
    /// 请求参数（必需）
    pub settings: &'a SamplingSettings,
    pub retry: RetryPolicy,
    /// 可选：事件推送通道
    pub events: EventSink,
    /// 可选：用量账本
    pub usage: Option<&'a UsageLedger>,
}

impl<'a> SamplingSession<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        registry: &'a ToolRegistry,
        executor: &'a ToolExecutor,
        settings: &'a SamplingSettings,
    ) -> Self {
        Self {
            llm,
            registry,
            executor,
            settings,
            retry: RetryPolicy::default(),
            events: EventSink::none(),
            usage: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_usage(mut self, usage: &'a UsageLedger) -> Self {
        self.usage = Some(usage);
        self
    }

    /// 由当前历史组装请求（历史只读）
    pub fn build_request(&self, history: &History) -> MessageRequest {
        self.request_for(history.serialize())
    }

    fn request_for(&self, messages: Vec<WireMessage>) -> MessageRequest {
        MessageRequest {
            model: self.settings.model.clone(),
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
            system: self.settings.system_prompt.clone(),
            messages,
            tools: self.registry.manifest(),
            extra: self.settings.params.clone(),
        }
    }

    /// system prompt 与工具清单的 token 基线：远端计数（减去占位消息的 1 token），失败时本地估算
    pub async fn measure_baseline(&self) -> u64 {
        let counted = self.request_for(vec![WireMessage {
            role: WireRole::User,
            content: vec![ContentBlock::text(".")],
        }]);
        match self.llm.count_tokens(&counted).await {
            Ok(n) => n.saturating_sub(1),
            Err(e) => {
                let tools = serde_json::to_string(&counted.tools).unwrap_or_default();
                let estimate = TokenEstimator::estimate(&self.settings.system_prompt)
                    + if counted.tools.is_empty() { 0 } else { TokenEstimator::estimate(&tools) };
                tracing::debug!(error = %e, estimate, "token count endpoint unavailable, using local estimate");
                estimate
            }
        }
    }

    /// 驱动循环直到模型不再请求工具
    pub async fn run(&self, history: &mut History) -> Result<SamplingOutcome, AgentError> {
        let mut backoff = Backoff::new(self.retry);
        let mut iteration = 0usize;

        loop {
            iteration += 1;
            if let Some(max) = self.settings.max_iterations {
                if iteration > max {
                    tracing::warn!(max, "iteration limit reached");
                    return Err(AgentError::IterationLimit(max));
                }
            }
            self.events.emit(LoopEvent::Iteration { iteration });

            // (a)
            self.prepare_history(history, iteration).await;

            // (b)
            let request = self.build_request(history);

            // (c)
            let response = self.send_with_retry(&request, &mut backoff).await?;

            // (d)
            self.record_usage(iteration, &response);
            let invocations = response.tool_invocations();
            let text = response.text();
            if !text.is_empty() {
                self.events.emit(LoopEvent::AssistantText { text: text.clone() });
            }
            history.add_turn(Role::Assistant, response.content, Some(response.usage));

            // (e)
            if invocations.is_empty() {
                tracing::info!(iterations = iteration, "sampling loop finished");
                self.events.emit(LoopEvent::Finished {
                    iterations: iteration,
                });
                return Ok(SamplingOutcome {
                    reply: text,
                    iterations: iteration,
                });
            }

            for inv in &invocations {
                tracing::info!(tool = %inv.name, id = %inv.id, "tool requested");
                self.events.emit(LoopEvent::ToolCall {
                    id: inv.id.clone(),
                    name: inv.name.clone(),
                    input: inv.input.clone(),
                });
            }
            let outcomes = self.executor.dispatch(self.registry, &invocations).await;
            for o in &outcomes {
                self.events.emit(LoopEvent::ToolResult {
                    id: o.id.clone(),
                    is_error: o.is_error,
                    preview: preview(&o.text, 200),
                });
            }
            // 整批结果收齐后一次性追加
            history.add_turn(
                Role::ToolResult,
                outcomes.into_iter().map(|o| o.into_block()).collect(),
                None,
            );
        }
    }

    async fn prepare_history(&self, history: &mut History, iteration: usize) {
        if let Some(media) = &self.settings.media {
            history.evict_media(media);
        }

        let interval = self.settings.token_count_interval;
        if interval > 0 && iteration % interval == 0 {
            match self.llm.count_tokens(&self.build_request(history)).await {
                Ok(measured) => {
                    tracing::debug!(measured, estimated = history.estimated_tokens(), "token ledger calibrated");
                    history.calibrate(measured);
                }
                Err(e) => tracing::debug!(error = %e, "token count failed, keeping estimate"),
            }
        }

        let report = history.truncate();
        if report.removed_turns > 0 {
            self.events.emit(LoopEvent::HistoryTruncated {
                removed_turns: report.removed_turns,
                tokens_after: report.tokens_after,
            });
        }
    }

    async fn send_with_retry(
        &self,
        request: &MessageRequest,
        backoff: &mut Backoff,
    ) -> Result<MessageResponse, AgentError> {
        loop {
            match self.llm.create_message(request).await {
                Ok(response) => {
                    backoff.reset();
                    return Ok(response);
                }
                Err(e) => match backoff.next_action(&e) {
                    RecoveryAction::RetryAfter(delay) => {
                        let attempt = backoff.consecutive_failures();
                        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "rate limited, backing off");
                        self.events.emit(LoopEvent::RateLimited {
                            attempt,
                            delay_ms: delay.as_millis() as u64,
                            message: e.to_string(),
                        });
                        tokio::time::sleep(delay).await;
                    }
                    RecoveryAction::Abort => return Err(abort_error(e, backoff)),
                },
            }
        }
    }

    fn record_usage(&self, iteration: usize, response: &MessageResponse) {
        let u = &response.usage;
        if let Some(ledger) = self.usage {
            ledger.record(&self.settings.model, iteration, u);
        }
        self.events.emit(LoopEvent::Usage {
            iteration,
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_input_tokens: u.cache_read_input_tokens.unwrap_or(0),
            cache_creation_input_tokens: u.cache_creation_input_tokens.unwrap_or(0),
        });
    }
}

fn abort_error(e: LlmError, backoff: &Backoff) -> AgentError {
    match e {
        LlmError::RateLimited(message) => AgentError::RateLimitExhausted {
            attempts: backoff.consecutive_failures(),
            message,
        },
        other => {
            tracing::error!(error = %other, "model request failed");
            AgentError::Llm(other)
        }
    }
}

/// 测试与示例用的快速重试策略
pub fn fast_retry(max_attempts: Option<u32>) -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        max_attempts,
    }
}
