//! 工具执行器
//!
//! dispatch 对一批 ToolInvocation 并发（或顺序）执行：每次调用独立 spawn 并施加超时，
//! 失败 / 超时 / panic 都转为错误 ToolOutcome，不影响同批其他调用；每次调用输出结构化审计日志（JSON）。
//! 返回前按调用顺序对齐结果，保证一一对应。

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::llm::ToolInvocation;
use crate::memory::{ContentBlock, ImageSource, ToolResultContent};
use crate::tools::{ToolHandler, ToolRegistry};

/// 调度模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Concurrent,
    /// 逐个执行，用于有并发副作用的工具
    Sequential,
}

/// 单次调用的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub id: String,
    pub text: String,
    pub is_error: bool,
    pub image: Option<ImageSource>,
}

impl ToolOutcome {
    pub fn success(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            is_error: false,
            image: None,
        }
    }

    pub fn error(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            is_error: true,
            image: None,
        }
    }

    /// 转为 tool_result 块；错误结果只携带文本
    pub fn into_block(self) -> ContentBlock {
        let mut content = Vec::new();
        if !self.text.is_empty() || self.is_error {
            content.push(ToolResultContent::Text { text: self.text });
        }
        if !self.is_error {
            if let Some(source) = self.image {
                content.push(ToolResultContent::Image { source });
            }
        }
        ContentBlock::ToolResult {
            tool_use_id: self.id,
            content,
            is_error: self.is_error,
        }
    }
}

/// 工具执行器：单次调用超时 + 调度模式
#[derive(Debug, Clone)]
pub struct ToolExecutor {
    timeout: Duration,
    mode: DispatchMode,
}

impl ToolExecutor {
    pub fn new(timeout: Duration, mode: DispatchMode) -> Self {
        Self { timeout, mode }
    }

    /// 执行一批调用，结果数与调用数相等且 id 一一对应（按调用顺序）
    pub async fn dispatch(
        &self,
        registry: &ToolRegistry,
        invocations: &[ToolInvocation],
    ) -> Vec<ToolOutcome> {
        let mut outcomes = Vec::with_capacity(invocations.len());
        let mut tasks = TaskSet::default();

        for inv in invocations {
            let Some(descriptor) = registry.get(&inv.name) else {
                tracing::warn!(tool = %inv.name, id = %inv.id, "tool not found");
                outcomes.push(ToolOutcome::error(
                    inv.id.clone(),
                    format!("Tool '{}' not found", inv.name),
                ));
                continue;
            };
            let handle = tokio::spawn(run_one(
                descriptor.handler.clone(),
                inv.clone(),
                self.timeout,
            ));
            tasks.push(inv.id.clone(), handle);
            if self.mode == DispatchMode::Sequential {
                // 等当前调用结束再启动下一个；仍登记在 TaskSet 中，批次被放弃时一样会中止
                if let Some(outcome) = tasks.join_last().await {
                    outcomes.push(outcome);
                }
            }
        }

        let ids: Vec<String> = tasks.0.iter().map(|(id, _)| id.clone()).collect();
        let joined = join_all(tasks.0.iter_mut().map(|(_, h)| h)).await;
        outcomes.extend(
            ids.into_iter()
                .zip(joined)
                .map(|(id, result)| join_outcome(id, result)),
        );

        reconcile(invocations, outcomes)
    }
}

/// 调用方放弃本批（外层超时 / 取消）时，尚未完成的任务随之中止
#[derive(Default)]
struct TaskSet(Vec<(String, JoinHandle<ToolOutcome>)>);

impl TaskSet {
    fn push(&mut self, id: String, handle: JoinHandle<ToolOutcome>) {
        self.0.push((id, handle));
    }

    /// 等待最后登记的任务并移出集合
    async fn join_last(&mut self) -> Option<ToolOutcome> {
        let (id, handle) = self.0.last_mut()?;
        let result = handle.await;
        let id = id.clone();
        self.0.pop();
        Some(join_outcome(id, result))
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for (_, handle) in &self.0 {
            handle.abort();
        }
    }
}

fn join_outcome(id: String, result: Result<ToolOutcome, tokio::task::JoinError>) -> ToolOutcome {
    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(id = %id, error = %e, "tool task failed");
            ToolOutcome::error(id, format!("Error executing tool: {}", e))
        }
    }
}

async fn run_one(handler: ToolHandler, inv: ToolInvocation, limit: Duration) -> ToolOutcome {
    let start = Instant::now();
    let args_preview = args_preview(&inv.input);
    let result = timeout(limit, handler.execute(inv.input)).await;

    let (ok, outcome): (bool, &str) = match &result {
        Ok(Ok(_)) => (true, "ok"),
        Ok(Err(_)) => (false, "error"),
        Err(_) => (false, "timeout"),
    };
    let duration_ms = start.elapsed().as_millis() as u64;
    let audit = serde_json::json!({
        "event": "tool_audit",
        "tool": inv.name,
        "id": inv.id,
        "handler": handler.kind(),
        "ok": ok,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview,
    });
    tracing::info!(audit = %audit.to_string(), "tool");

    match result {
        Ok(Ok(output)) => ToolOutcome {
            id: inv.id,
            text: output.text,
            is_error: false,
            image: output.image,
        },
        Ok(Err(e)) => ToolOutcome::error(inv.id, format!("Error executing tool: {}", e)),
        Err(_) => ToolOutcome::error(
            inv.id,
            format!("Tool '{}' timed out after {}s", inv.name, limit.as_secs_f64()),
        ),
    }
}

/// 按调用顺序对齐结果；缺失的补错误结果，多余的丢弃
pub fn reconcile(invocations: &[ToolInvocation], outcomes: Vec<ToolOutcome>) -> Vec<ToolOutcome> {
    let mut pool: Vec<Option<ToolOutcome>> = outcomes.into_iter().map(Some).collect();
    let aligned: Vec<ToolOutcome> = invocations
        .iter()
        .map(|inv| {
            pool.iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|o| o.id == inv.id))
                .and_then(Option::take)
                .unwrap_or_else(|| {
                    tracing::warn!(id = %inv.id, tool = %inv.name, "no outcome for invocation");
                    ToolOutcome::error(inv.id.clone(), "Error executing tool: no result produced")
                })
        })
        .collect();
    let dropped = pool.iter().filter(|s| s.is_some()).count();
    if dropped > 0 {
        tracing::warn!(dropped, "discarded outcomes with unknown invocation ids");
    }
    aligned
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
