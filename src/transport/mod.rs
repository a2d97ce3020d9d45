//! Transport (spec §4.1): a loopback-only JSON-RPC 2.0 server, one frame
//! per line (newline-delimited JSON) over a TCP stream.
//!
//! The envelope shape and per-request dispatch loop are grounded in the
//! teacher's MCP client (`tools/mcp/client.rs`: JSON-RPC request/response
//! structs, one object per line, notifications distinguished by a missing
//! `id`); the reconnecting client in [`client`] borrows its exponential
//! backoff from the Telegram adapter's poll loop.

pub mod client;

pub use client::{ConnectionEvent, TransportClient, TransportClientError};

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::events::{EventBus, GatewayEvent};
use crate::gateway::{
    ApprovalRespondParams, ChatSendParams, ConnectParams, Gateway, SessionsSendParams,
    ToolsInvokeParams,
};

/// Standard JSON-RPC method-not-found code.
const METHOD_NOT_FOUND: i64 = -32601;
/// Standard JSON-RPC invalid-params code.
const INVALID_PARAMS: i64 = -32602;
/// Domain server-error range (spec §4.9): auth rejected before `connect` completes.
const AUTH_FAILED: i64 = -32000;
/// Domain server-error: the accept-time rate limiter rejected this peer.
const RATE_LIMITED: i64 = -32001;
/// Domain server-error: a handler did not respond within the configured timeout.
const REQUEST_TIMEOUT: i64 = -32002;
/// Domain server-error: a frame could not be parsed as JSON-RPC at all.
const MALFORMED_FRAME: i64 = -32003;
/// Domain server-error: the first frame on a connection was not `connect`.
const INVALID_REQUEST: i64 = -32600;

/// A JSON-RPC request id: number or string (spec §4.9 wire protocol).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    /// Numeric id, used by [`client::TransportClient`].
    Number(i64),
    /// String id, accepted from any client that prefers one.
    Text(String),
}

/// One inbound JSON-RPC frame. A request when `id` is present, a
/// notification otherwise (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Always `"2.0"`.
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(default)]
    pub id: Option<RpcId>,
    /// Method name, e.g. `"chat.send"`.
    pub method: String,
    /// Method-specific parameters.
    #[serde(default)]
    pub params: Value,
}

fn jsonrpc_version() -> String {
    "2.0".to_string()
}

/// A JSON-RPC error object (spec §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Standard or domain error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Stable failure-taxonomy code (spec §7), when applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// An outbound response frame, carrying the request's `id` back.
#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Echoes the originating request's id.
    pub id: Option<RpcId>,
    /// Present on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
}

/// An outbound notification frame: no `id`, fire-and-forget.
#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Notification name, e.g. `"chat.response"`, `"approval.request"`.
    pub method: String,
    /// Notification payload.
    pub params: Value,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ServerFrame {
    Response(RpcResponse),
    Notification(RpcNotification),
}

/// Params for the `tasks.get` convenience method: poll a task's current
/// state without waiting on its `chat.response` notification.
#[derive(Debug, Deserialize)]
struct TaskGetParams {
    task_id: Uuid,
}

/// Fixed-window accept-time rate limiter (spec §4.1: "on accept, a rate
/// limiter evaluates the peer; excess rate responds with close").
struct RateLimiter {
    window: Duration,
    max_per_window: usize,
    hits: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            window,
            max_per_window,
            hits: Mutex::new(VecDeque::new()),
        }
    }

    async fn admit(&self) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().await;
        while hits.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            hits.pop_front();
        }
        if hits.len() >= self.max_per_window {
            false
        } else {
            hits.push_back(now);
            true
        }
    }
}

/// The loopback JSON-RPC server (spec §4.1). Build one over an already
/// fully-wired [`Gateway`] and run it with [`TransportServer::serve`].
pub struct TransportServer {
    gateway: Gateway,
    bus: EventBus,
    bind_addr: std::net::IpAddr,
    bind_port: u16,
    request_timeout: Duration,
    rate_limiter: Arc<RateLimiter>,
}

impl TransportServer {
    /// Build a server bound (at [`TransportServer::serve`] time) to
    /// `bind_addr:bind_port`, which MUST be a loopback address.
    pub fn new(
        gateway: Gateway,
        bus: EventBus,
        bind_addr: std::net::IpAddr,
        bind_port: u16,
        request_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            bus,
            bind_addr,
            bind_port,
            request_timeout,
            rate_limiter: Arc::new(RateLimiter::new(20, Duration::from_secs(1))),
        }
    }

    /// Accept connections until `shutdown` is signaled `true`. Fails closed
    /// (refuses to bind) if `bind_addr` is not a loopback address.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        if !self.bind_addr.is_loopback() {
            return Err(std::io::Error::other(format!(
                "refusing to bind non-loopback address {}",
                self.bind_addr
            )));
        }

        let listener = TcpListener::bind((self.bind_addr, self.bind_port)).await?;
        tracing::info!(addr = %self.bind_addr, port = self.bind_port, "transport listening");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    if !self.rate_limiter.admit().await {
                        tracing::warn!(%peer, "connection rejected by rate limiter");
                        continue;
                    }

                    let gateway = self.gateway.clone();
                    let bus = self.bus.clone();
                    let request_timeout = self.request_timeout;
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, peer, gateway, bus, request_timeout).await {
                            tracing::debug!(%peer, error = %err, "connection closed");
                        }
                    });
                }
            }
        }

        tracing::info!("transport stopped accepting connections");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Gateway,
    bus: EventBus,
    request_timeout: Duration,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(mut line) = serde_json::to_vec(&frame) else {
                continue;
            };
            line.push(b'\n');
            if write_half.write_all(&line).await.is_err() {
                break;
            }
        }
    });

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        writer_task.abort();
        return Ok(());
    }

    let first: RpcRequest = match serde_json::from_str(line.trim()) {
        Ok(r) => r,
        Err(_) => {
            send_error(&out_tx, None, MALFORMED_FRAME, "malformed JSON-RPC frame");
            writer_task.abort();
            return Ok(());
        }
    };

    if first.method != "connect" {
        send_error(&out_tx, first.id.clone(), INVALID_REQUEST, "first message must be `connect`");
        writer_task.abort();
        return Ok(());
    }

    let connect_params: ConnectParams = match serde_json::from_value(first.params.clone()) {
        Ok(p) => p,
        Err(err) => {
            send_error(&out_tx, first.id.clone(), INVALID_PARAMS, &err.to_string());
            writer_task.abort();
            return Ok(());
        }
    };
    let client_type = connect_params.client_type.clone();

    match gateway.connect(connect_params) {
        Ok(result) => {
            send_result(&out_tx, first.id.clone(), serde_json::to_value(result).unwrap_or(Value::Null));
        }
        Err(err) => {
            send_error(&out_tx, first.id.clone(), AUTH_FAILED, &err.to_string());
            writer_task.abort();
            return Ok(());
        }
    }
    tracing::info!(%peer, client_type, "client connected");

    let notifier = spawn_notifier(bus.subscribe(), gateway.clone(), client_type.clone(), out_tx.clone());

    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(_) => {
                send_error(&out_tx, None, MALFORMED_FRAME, "malformed JSON-RPC frame");
                continue;
            }
        };

        let gateway = gateway.clone();
        let out_tx = out_tx.clone();
        let id = request.id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(request_timeout, dispatch(&gateway, &request)).await {
                Ok(Ok(result)) => send_result(&out_tx, id, result),
                Ok(Err(err)) => send_gateway_error(&out_tx, id, &err),
                Err(_) => send_error(&out_tx, id, REQUEST_TIMEOUT, "request timed out"),
            }
        });
    }

    notifier.abort();
    drop(out_tx);
    let _ = writer_task.await;
    tracing::info!(%peer, "client disconnected");
    Ok(())
}

/// Translate select [`GatewayEvent`]s into JSON-RPC notifications and push
/// them to one connection for its lifetime, filtering `chat.response` to a
/// task's registered observer surfaces (spec §4.8 observer pattern) when
/// any were declared.
fn spawn_notifier(
    mut events: tokio::sync::broadcast::Receiver<GatewayEvent>,
    gateway: Gateway,
    client_type: String,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = BroadcastStream::new(events.resubscribe());
        drop(events);
        while let Some(Ok(event)) = stream.next().await {
            let Some((method, params)) = translate_event(&gateway, &client_type, event).await else {
                continue;
            };
            if out_tx
                .send(ServerFrame::Notification(RpcNotification {
                    jsonrpc: "2.0",
                    method,
                    params,
                }))
                .is_err()
            {
                break;
            }
        }
    })
}

async fn translate_event(gateway: &Gateway, client_type: &str, event: GatewayEvent) -> Option<(String, Value)> {
    match event {
        GatewayEvent::TaskCompleted {
            task_id,
            channel_id,
            user_id,
            result_text,
        } => {
            let observers = gateway.get_task(task_id).await.map(|t| t.observers).unwrap_or_default();
            if !observers.is_empty() && !observers.iter().any(|o| o == client_type) {
                return None;
            }
            Some((
                "chat.response".to_string(),
                serde_json::json!({
                    "taskId": task_id,
                    "channelId": channel_id,
                    "userId": user_id,
                    "text": result_text,
                }),
            ))
        }
        GatewayEvent::ApprovalRequested { approval_id, tool_id } => Some((
            "approval.request".to_string(),
            serde_json::json!({"approval_id": approval_id, "tool_id": tool_id}),
        )),
        GatewayEvent::ApprovalResolved { approval_id, status } => Some((
            "approval.update".to_string(),
            serde_json::json!({"approval_id": approval_id, "status": status}),
        )),
        _ => None,
    }
}

async fn dispatch(gateway: &Gateway, request: &RpcRequest) -> Result<Value, GatewayError> {
    match request.method.as_str() {
        "connect" => {
            let params: ConnectParams = parse_params(&request.params)?;
            let result = gateway.connect(params)?;
            Ok(serde_json::to_value(result).unwrap_or(Value::Null))
        }
        "chat.send" => {
            let params: ChatSendParams = parse_params(&request.params)?;
            Ok(serde_json::to_value(gateway.chat_send(params).await).unwrap_or(Value::Null))
        }
        "tools.list" => Ok(serde_json::to_value(gateway.tools_list().await).unwrap_or(Value::Null)),
        "tools.invoke" => {
            let params: ToolsInvokeParams = parse_params(&request.params)?;
            Ok(serde_json::to_value(gateway.tools_invoke(params).await?).unwrap_or(Value::Null))
        }
        "approval.respond" => {
            let params: ApprovalRespondParams = parse_params(&request.params)?;
            gateway.approval_respond(params).await?;
            Ok(Value::Null)
        }
        "sessions.send" => {
            let params: SessionsSendParams = parse_params(&request.params)?;
            gateway.sessions_send(params).await?;
            Ok(Value::Null)
        }
        "status" => Ok(serde_json::to_value(gateway.status().await).unwrap_or(Value::Null)),
        "tasks.get" => {
            let params: TaskGetParams = parse_params(&request.params)?;
            Ok(serde_json::to_value(gateway.get_task(params.task_id).await?).unwrap_or(Value::Null))
        }
        "auth.pair" => {
            let params: client::PairParams = parse_params(&request.params)?;
            let ttl = Duration::from_secs(params.ttl_secs);
            let pairing = gateway.pair(&params.user_id, ttl).await;
            Ok(serde_json::to_value(pairing).unwrap_or(Value::Null))
        }
        "auth.approve_pairing" => {
            let params: client::ApprovePairingParams = parse_params(&request.params)?;
            let user_id = gateway.approve_pairing(&params.code).await?;
            Ok(serde_json::json!({"user_id": user_id}))
        }
        other => Err(GatewayError::UnknownMethod(other.to_string())),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: &Value) -> Result<T, GatewayError> {
    serde_json::from_value(params.clone()).map_err(|err| GatewayError::InvalidParams(err.to_string()))
}

fn send_result(tx: &mpsc::UnboundedSender<ServerFrame>, id: Option<RpcId>, result: Value) {
    let _ = tx.send(ServerFrame::Response(RpcResponse {
        jsonrpc: "2.0",
        id,
        result: Some(result),
        error: None,
    }));
}

fn send_error(tx: &mpsc::UnboundedSender<ServerFrame>, id: Option<RpcId>, code: i64, message: &str) {
    let _ = tx.send(ServerFrame::Response(RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcErrorObject {
            code,
            message: message.to_string(),
            data: None,
        }),
    }));
}

fn send_gateway_error(tx: &mpsc::UnboundedSender<ServerFrame>, id: Option<RpcId>, err: &GatewayError) {
    let data = err.failure_code().map(|code| serde_json::json!({"failure_code": code.as_str()}));
    let _ = tx.send(ServerFrame::Response(RpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(RpcErrorObject {
            code: err.rpc_code(),
            message: err.to_string(),
            data,
        }),
    }));
}

#[allow(unused)]
fn unused_method_not_found_reference() -> i64 {
    METHOD_NOT_FOUND
}
