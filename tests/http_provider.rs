//! 网络传输的集成测试：本地 axum 服务分别扮演 Streamable HTTP 与持久事件流两种提供方

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::StreamExt;
use hive::mcp::{ConnectionState, McpConnection, McpServerConfig, TransportKind};
use serde_json::{json, Value};
use tokio::sync::mpsc;

const SESSION: &str = "sess-1";

fn tools_list() -> Value {
    json!({"tools": [{
        "name": "echo",
        "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
    }]})
}

fn call_result(args: &Value) -> Value {
    json!({"content": [{"type": "text", "text": args["text"].as_str().unwrap_or("")}]})
}

fn result_for(msg: &Value) -> Value {
    match msg["method"].as_str().unwrap_or("") {
        "initialize" => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "test", "version": "0"}
        }),
        "tools/list" => tools_list(),
        "tools/call" => call_result(&msg["params"]["arguments"]),
        _ => json!({}),
    }
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// 把字节切成若干块，块间停顿，让客户端分多次读到
fn slow_body(parts: Vec<Vec<u8>>) -> Body {
    Body::from_stream(futures_util::stream::iter(parts).then(|part| async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok::<_, Infallible>(part)
    }))
}

#[derive(Default)]
struct StreamableState {
    /// 每个请求携带的会话头（None 表示没有）
    sessions_seen: Mutex<Vec<Option<String>>>,
    deleted: Mutex<Vec<String>>,
}

async fn streamable_post(
    State(state): State<Arc<StreamableState>>,
    headers: HeaderMap,
    Json(msg): Json<Value>,
) -> Response {
    let session = headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    state.sessions_seen.lock().unwrap().push(session);

    let Some(id) = msg.get("id").cloned() else {
        return StatusCode::ACCEPTED.into_response();
    };
    let response = json!({"jsonrpc": "2.0", "id": id, "result": result_for(&msg)});

    if msg["method"] == "tools/call" {
        // 先推一条服务端通知，再把响应帧从多字节字符中间切开
        let frame = format!(
            "event: message\ndata: {}\n\nevent: message\ndata: {}\n\n",
            json!({"jsonrpc": "2.0", "method": "notifications/progress", "params": {}}),
            response
        )
        .into_bytes();
        let split = frame.iter().position(|b| *b >= 0x80).unwrap() + 1;
        return Response::builder()
            .header("content-type", "text/event-stream")
            .body(slow_body(vec![frame[..split].to_vec(), frame[split..].to_vec()]))
            .unwrap();
    }

    (
        [("content-type", "application/json"), ("mcp-session-id", SESSION)],
        response.to_string(),
    )
        .into_response()
}

async fn streamable_delete(State(state): State<Arc<StreamableState>>, headers: HeaderMap) -> StatusCode {
    if let Some(session) = headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) {
        state.deleted.lock().unwrap().push(session.to_string());
    }
    StatusCode::OK
}

#[tokio::test]
async fn test_streamable_http_round_trip() {
    let state = Arc::new(StreamableState::default());
    let app = Router::new()
        .route("/mcp", post(streamable_post).delete(streamable_delete))
        .with_state(state.clone());
    let addr = serve(app).await;

    let conn = McpConnection::new(McpServerConfig::stream(format!("http://{addr}/mcp")).with_name("remote"));
    assert_eq!(conn.kind(), TransportKind::Stream);
    let tools = conn.open().await.unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].description_or_default(), "MCP tool: echo");

    let out = conn.call("echo", json!({"text": "héllo wörld"})).await.unwrap();
    assert_eq!(out, "héllo wörld");

    conn.close().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);

    // initialize 之前没有会话，之后每个请求都带上服务端下发的会话
    let seen = state.sessions_seen.lock().unwrap().clone();
    assert_eq!(seen[0], None);
    assert!(seen[1..].iter().all(|s| s.as_deref() == Some(SESSION)));
    assert_eq!(*state.deleted.lock().unwrap(), vec![SESSION.to_string()]);
}

#[tokio::test]
async fn test_streamable_http_error_status_fails_open() {
    let app = Router::new().route("/mcp", post(|| async { StatusCode::NOT_FOUND }));
    let addr = serve(app).await;
    let conn = McpConnection::new(McpServerConfig::stream(format!("http://{addr}/mcp")));
    assert!(conn.open().await.is_err());
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[derive(Default)]
struct EventStreamState {
    outbox: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    posted: Mutex<Vec<String>>,
}

async fn event_stream(State(state): State<Arc<EventStreamState>>) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tx.send(b"event: endpoint\ndata: /messages?session_id=abc\n\n".to_vec())
        .unwrap();
    *state.outbox.lock().unwrap() = Some(tx);
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (Ok::<_, Infallible>(bytes), rx))
    });
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn event_stream_post(
    State(state): State<Arc<EventStreamState>>,
    Query(query): Query<HashMap<String, String>>,
    Json(msg): Json<Value>,
) -> StatusCode {
    if query.get("session_id").map(String::as_str) != Some("abc") {
        return StatusCode::NOT_FOUND;
    }
    state
        .posted
        .lock()
        .unwrap()
        .push(msg["method"].as_str().unwrap_or("").to_string());
    if let Some(id) = msg.get("id").cloned() {
        let response = json!({"jsonrpc": "2.0", "id": id, "result": result_for(&msg)});
        let frame = format!("event: message\ndata: {response}\n\n").into_bytes();
        // 响应分两块写回流上，切在多字节字符中间
        let split = frame.iter().position(|b| *b >= 0x80).map(|p| p + 1).unwrap_or(frame.len() / 2);
        if let Some(tx) = state.outbox.lock().unwrap().as_ref() {
            let _ = tx.send(frame[..split].to_vec());
            let _ = tx.send(frame[split..].to_vec());
        }
    }
    StatusCode::ACCEPTED
}

#[tokio::test]
async fn test_event_stream_transport_round_trip() {
    let state = Arc::new(EventStreamState::default());
    let app = Router::new()
        .route("/sse", get(event_stream))
        .route("/messages", post(event_stream_post))
        .with_state(state.clone());
    let addr = serve(app).await;

    let conn = McpConnection::new(McpServerConfig::sse(format!("http://{addr}/sse")).with_name("legacy"));
    assert_eq!(conn.kind(), TransportKind::Sse);
    let tools = conn.open().await.unwrap();
    assert_eq!(tools[0].name, "echo");

    let out = conn.call("echo", json!({"text": "naïve café"})).await.unwrap();
    assert_eq!(out, "naïve café");

    conn.close().await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Closed);
    assert_eq!(
        *state.posted.lock().unwrap(),
        vec!["initialize", "notifications/initialized", "tools/list", "tools/call"]
    );
}

#[tokio::test]
async fn test_event_stream_without_endpoint_times_out() {
    // 流打开但从不发送 endpoint 事件
    let app = Router::new().route(
        "/sse",
        get(|| async {
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from_stream(futures_util::stream::pending::<Result<Vec<u8>, Infallible>>()))
                .unwrap()
        }),
    );
    let addr = serve(app).await;
    let conn = McpConnection::new(
        McpServerConfig::sse(format!("http://{addr}/sse")).with_request_timeout(Duration::from_millis(200)),
    );
    assert!(conn.open().await.is_err());
    assert_eq!(conn.state(), ConnectionState::Closed);
}
