//! hive-calculator：基于 stdio 的计算器工具提供方
//!
//! 每行一条 JSON-RPC 消息：处理 initialize、tools/list、tools/call 与 ping，通知只读不回。
//! 日志写 stderr，stdout 只承载协议消息。

use hive::mcp::protocol::{
    Implementation, JsonRpcResponse, ListToolsResult, McpToolDefinition, ToolCallResult,
    PROTOCOL_VERSION,
};
use hive::tools::calculator::{calculate, calculator_schema, CalculatorArgs, CALCULATOR_DESCRIPTION};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const PARSE_ERROR: i64 = -32700;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let Some(response) = handle_line(&line) else {
            continue;
        };
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }
    tracing::debug!("stdin closed, exiting");
    Ok(())
}

/// 处理一行输入；通知返回 None
fn handle_line(line: &str) -> Option<JsonRpcResponse> {
    let msg: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return Some(JsonRpcResponse::failure(Value::Null, PARSE_ERROR, e.to_string())),
    };
    let method = msg.get("method").and_then(Value::as_str).unwrap_or_default();
    let id = msg.get("id").cloned()?;
    let params = msg.get("params").cloned().unwrap_or(Value::Null);

    let result = match method {
        "initialize" => {
            let info = Implementation {
                name: "hive-calculator".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            };
            Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": info,
            }))
        }
        "ping" => Ok(json!({})),
        "tools/list" => serde_json::to_value(ListToolsResult {
            tools: vec![McpToolDefinition {
                name: "calculator".to_string(),
                description: Some(CALCULATOR_DESCRIPTION.to_string()),
                input_schema: calculator_schema(),
            }],
        })
        .map_err(|e| (INVALID_PARAMS, e.to_string())),
        "tools/call" => call_tool(&params),
        other => Err((METHOD_NOT_FOUND, format!("Method not found: {}", other))),
    };

    Some(match result {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err((code, message)) => JsonRpcResponse::failure(id, code, message),
    })
}

fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    if name != "calculator" {
        return Err((INVALID_PARAMS, format!("Unknown tool: {}", name)));
    }
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let result = match serde_json::from_value::<CalculatorArgs>(arguments) {
        Ok(args) => {
            let text = calculate(&args);
            tracing::info!(tool = "calculator", result = %text, "tool call");
            ToolCallResult::text(text)
        }
        Err(e) => ToolCallResult {
            is_error: true,
            ..ToolCallResult::text(format!("Invalid arguments: {}", e))
        },
    };
    serde_json::to_value(result).map_err(|e| (INVALID_PARAMS, e.to_string()))
}
