//! MCP 传输层
//!
//! StdioTransport：子进程 + 按行 JSON-RPC；后台读任务按 id 把响应路由给等待方（kill_on_drop）。
//! SseTransport：GET 建立持久事件流，`endpoint` 事件给出 POST 地址；响应从事件流按 id 路由回来。
//! HttpTransport：Streamable HTTP，JSON-RPC over POST，响应可为 JSON 或 SSE 帧；维护 Mcp-Session-Id，关闭时 DELETE 会话。

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::mcp::config::{McpServerConfig, TransportConfig, TransportKind};
use crate::mcp::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::mcp::sse::{SseDecoder, SseEvent};
use crate::mcp::McpError;

const SESSION_HEADER: &str = "Mcp-Session-Id";
/// 关闭 stdin 后等待子进程自行退出的时间
const GRACEFUL_EXIT: Duration = Duration::from_secs(2);

/// 传输抽象：请求 / 通知 / 关闭
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// 发送请求并等待同 id 的响应，返回 result
    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError>;

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError>;

    /// 正常关闭；重复调用应为 no-op
    async fn close(&self) -> Result<(), McpError>;

    /// 同步中止（用于 Drop 路径），不等待
    fn abort(&self) {}
}

/// 按配置建立传输（stdio 会立即启动子进程）
pub async fn connect(config: &McpServerConfig) -> Result<Arc<dyn Transport>, McpError> {
    match &config.transport {
        TransportConfig::Stdio { command, args, env } => Ok(Arc::new(StdioTransport::spawn(
            &config.name,
            command,
            args,
            env,
            config.request_timeout,
        )?)),
        TransportConfig::Sse { url, headers } => Ok(Arc::new(
            SseTransport::connect(&config.name, url, headers, config.request_timeout).await?,
        )),
        TransportConfig::Stream { url, headers } => Ok(Arc::new(HttpTransport::new(
            &config.name,
            url,
            headers,
            config.request_timeout,
        )?)),
    }
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// 子进程 stdio 传输
pub struct StdioTransport {
    server: String,
    next_id: AtomicU64,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pending: Pending,
    reader: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl StdioTransport {
    pub fn spawn(
        server: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self, McpError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // 只继承必要的系统变量，再注入显式配置的 env
        cmd.env_clear();
        for key in ["PATH", "HOME", "USER", "LOGNAME", "SHELL", "LANG", "TERM"] {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        cmd.envs(env);

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::SpawnFailed(format!("failed to spawn '{command}': {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::SpawnFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::SpawnFailed("failed to capture stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, line = %line, "provider stderr");
                }
            });
        }

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(server.to_string(), stdout, pending.clone()));
        tracing::debug!(server = %server, command = %command, "provider process spawned");

        Ok(Self {
            server: server.to_string(),
            next_id: AtomicU64::new(1),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            pending,
            reader: Mutex::new(Some(reader)),
            request_timeout,
        })
    }

    async fn write_line(&self, line: String) -> Result<(), McpError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| McpError::Transport("stdin already closed".into()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

}

/// 只接受响应；服务端发起的请求 / 通知（带 method）与非 JSON 行返回 None
fn parse_response_line(line: &str) -> Option<JsonRpcResponse> {
    let value: Value = serde_json::from_str(line).ok()?;
    if value.get("method").is_some() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// 把一条消息交给同 id 的等待方；非响应与无人等待的消息只记录
fn route_response(server: &str, pending: &Pending, message: &str) {
    match parse_response_line(message) {
        Some(resp) => {
            let waiter = resp
                .numeric_id()
                .and_then(|id| pending.lock().ok().and_then(|mut p| p.remove(&id)));
            match waiter {
                Some(tx) => {
                    let _ = tx.send(resp);
                }
                None => tracing::debug!(server = %server, id = ?resp.id, "unmatched message from provider"),
            }
        }
        None => tracing::debug!(server = %server, line = message, "ignoring non-response message"),
    }
}

fn forget(pending: &Pending, id: u64) {
    if let Ok(mut pending) = pending.lock() {
        pending.remove(&id);
    }
}

/// 读 stdout 直到 EOF：响应按 id 交给等待方，其余行忽略；EOF 时丢弃全部等待方
async fn read_loop(server: String, stdout: tokio::process::ChildStdout, pending: Pending) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                route_response(&server, &pending, trimmed);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "provider stdout read failed");
                break;
            }
        }
    }
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
    tracing::debug!(server = %server, "provider stdout closed");
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| McpError::Transport("pending map poisoned".into()))?
            .insert(id, tx);

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.write_line(line).await {
            forget(&self.pending, id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => resp.into_result(),
            Ok(Err(_)) => Err(McpError::Transport(format!(
                "provider '{}' closed before responding to {}",
                self.server, method
            ))),
            Err(_) => {
                forget(&self.pending, id);
                Err(McpError::Timeout(method.to_string()))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_line(line).await
    }

    async fn close(&self) -> Result<(), McpError> {
        // 关闭 stdin 让服务端自行退出，超时再强杀
        self.stdin.lock().await.take();
        let child = self.child.lock().ok().and_then(|mut c| c.take());
        if let Some(mut child) = child {
            match tokio::time::timeout(GRACEFUL_EXIT, child.wait()).await {
                Ok(Ok(status)) => tracing::debug!(server = %self.server, %status, "provider exited"),
                Ok(Err(e)) => tracing::debug!(server = %self.server, error = %e, "provider wait failed"),
                Err(_) => {
                    tracing::debug!(server = %self.server, "provider did not exit, killing");
                    child.kill().await?;
                }
            }
        }
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
        Ok(())
    }

    fn abort(&self) {
        if let Some(mut child) = self.child.lock().ok().and_then(|mut c| c.take()) {
            let _ = child.start_kill();
        }
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
    }
}

fn header_map(headers: &HashMap<String, String>) -> Result<reqwest::header::HeaderMap, McpError> {
    let mut map = reqwest::header::HeaderMap::new();
    for (k, v) in headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| McpError::Config(format!("invalid header name '{k}': {e}")))?;
        let value = reqwest::header::HeaderValue::from_str(v)
            .map_err(|e| McpError::Config(format!("invalid header value for '{k}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// 持久事件流传输：GET 打开流，endpoint 事件给出消息地址，请求 POST 过去，响应从流上回来
pub struct SseTransport {
    server: String,
    endpoint: String,
    http: reqwest::Client,
    headers: reqwest::header::HeaderMap,
    next_id: AtomicU64,
    pending: Pending,
    reader: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl SseTransport {
    /// 打开事件流并等待 endpoint 事件
    pub async fn connect(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self, McpError> {
        let headers = header_map(headers)?;
        // 流是长连接，不能设整体超时；只限制建连
        let http = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| McpError::Transport(e.to_string()))?;

        let open = http
            .get(url)
            .headers(headers.clone())
            .header("Accept", "text/event-stream")
            .send();
        let resp = tokio::time::timeout(request_timeout, open)
            .await
            .map_err(|_| McpError::Timeout("sse connect".into()))?
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(McpError::Transport(format!(
                "provider '{}' returned status {} for event stream",
                server,
                resp.status()
            )));
        }

        let base = resp.url().clone();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(sse_read_loop(
            server.to_string(),
            resp,
            pending.clone(),
            endpoint_tx,
        ));

        let endpoint = match tokio::time::timeout(request_timeout, endpoint_rx).await {
            Ok(Ok(path)) => base.join(&path).map_err(|e| {
                reader.abort();
                McpError::Protocol(format!("invalid endpoint '{path}': {e}"))
            })?,
            Ok(Err(_)) => {
                reader.abort();
                return Err(McpError::Transport(
                    "event stream closed before endpoint event".into(),
                ));
            }
            Err(_) => {
                reader.abort();
                return Err(McpError::Timeout("endpoint event".into()));
            }
        };
        tracing::debug!(server = %server, endpoint = %endpoint, "event stream ready");

        Ok(Self {
            server: server.to_string(),
            endpoint: endpoint.to_string(),
            http,
            headers,
            next_id: AtomicU64::new(1),
            pending,
            reader: Mutex::new(Some(reader)),
            request_timeout,
        })
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<(), McpError> {
        let resp = self
            .http
            .post(&self.endpoint)
            .headers(self.headers.clone())
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!(
                "provider '{}' returned status {}: {}",
                self.server, status, body
            )));
        }
        Ok(())
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
        if let Ok(mut p) = self.pending.lock() {
            p.clear();
        }
    }
}

/// 读事件流直到断开：第一个 endpoint 事件交给 connect，其余事件按 id 路由
async fn sse_read_loop(
    server: String,
    resp: reqwest::Response,
    pending: Pending,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = resp.bytes_stream();
    let mut decoder = SseDecoder::new();
    let mut handle = |event: SseEvent| {
        if event.event == "endpoint" {
            if let Some(tx) = endpoint_tx.take() {
                let _ = tx.send(event.data.trim().to_string());
            }
        } else {
            route_response(&server, &pending, event.data.trim());
        }
    };
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => decoder.push(&chunk).into_iter().for_each(&mut handle),
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "event stream read failed");
                break;
            }
        }
    }
    if let Some(event) = decoder.finish() {
        handle(event);
    }
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
    tracing::debug!(server = %server, "event stream closed");
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| McpError::Transport("pending map poisoned".into()))?
            .insert(id, tx);

        if let Err(e) = self.post(&JsonRpcRequest::new(id, method, params)).await {
            forget(&self.pending, id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(resp)) => resp.into_result(),
            Ok(Err(_)) => Err(McpError::Transport(format!(
                "event stream of '{}' closed before responding to {}",
                self.server, method
            ))),
            Err(_) => {
                forget(&self.pending, id);
                Err(McpError::Timeout(method.to_string()))
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.post(&JsonRpcNotification::new(method, params)).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.stop_reader();
        Ok(())
    }

    fn abort(&self) {
        self.stop_reader();
    }
}

/// Streamable HTTP 传输（响应可为 JSON 或 SSE）
pub struct HttpTransport {
    server: String,
    url: String,
    http: reqwest::Client,
    headers: reqwest::header::HeaderMap,
    session_id: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(
        server: &str,
        url: &str,
        headers: &HashMap<String, String>,
        request_timeout: Duration,
    ) -> Result<Self, McpError> {
        let map = header_map(headers)?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| McpError::Transport(e.to_string()))?;
        Ok(Self {
            server: server.to_string(),
            url: url.to_string(),
            http,
            headers: map,
            session_id: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn session(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<reqwest::Response, McpError> {
        let mut req = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header("Accept", "application/json, text/event-stream")
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(session) = self.session() {
            req = req.header(SESSION_HEADER, session);
        }
        let resp = req.send().await.map_err(|e| McpError::Transport(e.to_string()))?;

        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut s) = self.session_id.lock() {
                *s = Some(session.to_string());
            }
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Transport(format!(
                "provider '{}' returned status {}: {}",
                self.server, status, body
            )));
        }
        Ok(resp)
    }
}

/// 事件中 id 匹配的 JSON-RPC 响应（跳过服务端请求 / 通知）
fn response_for(events: &[SseEvent], expected_id: u64) -> Option<JsonRpcResponse> {
    events
        .iter()
        .filter_map(|e| parse_response_line(e.data.trim()))
        .find(|resp| resp.numeric_id() == Some(expected_id))
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let resp = self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            let mut stream = resp.bytes_stream();
            let mut decoder = SseDecoder::new();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| McpError::Transport(format!("SSE read failed: {e}")))?;
                if let Some(found) = response_for(&decoder.push(&chunk), id) {
                    return found.into_result();
                }
            }
            let tail: Vec<SseEvent> = decoder.finish().into_iter().collect();
            match response_for(&tail, id) {
                Some(found) => found.into_result(),
                None => Err(McpError::Protocol(format!("no response for {} in SSE stream", method))),
            }
        } else {
            let resp: JsonRpcResponse = resp
                .json()
                .await
                .map_err(|e| McpError::Protocol(format!("invalid JSON-RPC response: {e}")))?;
            resp.into_result()
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.post(&JsonRpcNotification::new(method, params)).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        let Some(session) = self.session_id.lock().ok().and_then(|mut s| s.take()) else {
            return Ok(());
        };
        let resp = self
            .http
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send()
            .await
            .map_err(|e| McpError::Transport(e.to_string()))?;
        // 405 表示服务端不支持显式结束会话
        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Err(McpError::Transport(format!(
                "session delete returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_for_matches_id() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(
            b"event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"sampling/createMessage\"}\n\n\
              data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n\
              data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"ok\":true}}\n\n",
        );
        let resp = response_for(&events, 2).unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
        assert!(response_for(&events, 3).is_none());
    }

    #[test]
    fn test_route_response_delivers_by_id() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);
        route_response("s", &pending, r#"{"jsonrpc":"2.0","id":3,"result":{}}"#);
        assert!(rx.try_recv().is_err());
        route_response("s", &pending, r#"{"jsonrpc":"2.0","id":7,"result":{"v":1}}"#);
        assert_eq!(rx.try_recv().unwrap().result.unwrap()["v"], 1);
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn test_parse_response_line_skips_requests() {
        assert!(parse_response_line(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).is_none());
        assert!(parse_response_line("starting server...").is_none());
        let resp = parse_response_line(r#"{"jsonrpc":"2.0","id":1,"result":null}"#).unwrap();
        assert_eq!(resp.numeric_id(), Some(1));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut headers = HashMap::new();
        headers.insert("bad header".to_string(), "v".to_string());
        let err = HttpTransport::new("s", "http://localhost", &headers, Duration::from_secs(1));
        assert!(matches!(err, Err(McpError::Config(_))));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let err = StdioTransport::spawn(
            "ghost",
            "/definitely/not/a/binary",
            &[],
            &HashMap::new(),
            Duration::from_secs(1),
        );
        assert!(matches!(err, Err(McpError::SpawnFailed(_))));
    }
}
