//! Reconnecting JSON-RPC client (spec §4.1: "surface adapters are
//! expected to hold a single long-lived connection to the gateway and
//! reconnect transparently across restarts").
//!
//! The wire format mirrors the teacher's MCP client
//! (`tools/mcp/client.rs`: one JSON-RPC object per line, a monotonic
//! request id, responses matched back to their caller, notifications
//! recognized by a missing `id`). The reconnect loop borrows its
//! exponential-backoff-with-cap shape from the Telegram adapter's
//! `poll_loop` (`adapters/telegram.rs`): backoff starts at
//! [`INITIAL_BACKOFF_MS`], doubles on every failed attempt, is capped at
//! [`MAX_BACKOFF_MS`], and resets the moment a connection succeeds.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

/// Initial backoff before the first reconnect attempt, in milliseconds.
const INITIAL_BACKOFF_MS: u64 = 1_000;

/// Maximum backoff between reconnect attempts, in milliseconds.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Capacity of the broadcast channel fanning out connection-lifecycle and
/// server-pushed notification events to every subscriber.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Params for the `auth.pair` method (spec §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairParams {
    /// User id the new pairing code will be bound to once approved.
    pub user_id: String,
    /// How long the issued code remains valid, in seconds.
    pub ttl_secs: u64,
}

/// Params for the `auth.approve_pairing` method (spec §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovePairingParams {
    /// The one-time code being redeemed.
    pub code: String,
}

/// Errors raised by [`TransportClient`] operations.
#[derive(Debug, Error)]
pub enum TransportClientError {
    /// The TCP connection could not be established or was lost mid-call.
    #[error("transport connection error: {0}")]
    Io(#[from] std::io::Error),
    /// A frame failed to serialize or an inbound frame failed to parse.
    #[error("transport JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// The server responded with a JSON-RPC error object.
    #[error("server error {code}: {message}")]
    Rpc {
        /// JSON-RPC (or domain) error code.
        code: i64,
        /// Human-readable message from the server.
        message: String,
        /// Stable failure-taxonomy payload, when the server attached one.
        data: Option<Value>,
    },
    /// The call's pending request was dropped because the connection
    /// closed before a response arrived. Every outstanding call is
    /// cancelled uniformly this way when a socket drops (spec §4.1).
    #[error("connection closed before a response arrived")]
    Disconnected,
    /// No response arrived within the call's timeout.
    #[error("request timed out")]
    Timeout,
}

/// Connection lifecycle events surfaced to callers so a surface adapter
/// can, e.g., pause outbound traffic while disconnected (spec §4.1).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The `connect` handshake completed and the client is authenticated.
    Connected,
    /// The socket was lost; every pending call has been failed with
    /// [`TransportClientError::Disconnected`].
    Disconnected,
    /// A reconnect attempt is about to be made after waiting `backoff_ms`.
    Reconnecting {
        /// 1-based count of reconnect attempts since the last success.
        attempt: u32,
        /// How long the client slept before this attempt, in milliseconds.
        backoff_ms: u64,
    },
}

/// A still-unparsed inbound frame: a response (carries `id`) or a
/// notification (no `id`, carries `method`).
#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<InboundError>,
}

#[derive(Debug, Deserialize)]
struct InboundError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

type PendingMap = Mutex<HashMap<i64, oneshot::Sender<Result<Value, TransportClientError>>>>;

struct Shared {
    addr: SocketAddr,
    token: String,
    client_type: String,
    version: String,
    next_id: AtomicI64,
    pending: PendingMap,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    call_timeout: Duration,
    connection_events: broadcast::Sender<ConnectionEvent>,
    notifications: broadcast::Sender<(String, Value)>,
}

/// A single long-lived connection to the gateway's [`super::TransportServer`]
/// that reconnects transparently on failure (spec §4.1).
///
/// Cloning a [`TransportClient`] shares the same underlying connection and
/// pending-request table.
#[derive(Clone)]
pub struct TransportClient {
    shared: Arc<Shared>,
}

impl TransportClient {
    /// Start the reconnect loop in the background and return a handle.
    /// The handle is usable immediately; calls made before the first
    /// handshake completes simply wait on the connection or time out.
    pub fn connect(addr: SocketAddr, token: String, client_type: String, version: String) -> Self {
        Self::connect_with_timeout(addr, token, client_type, version, Duration::from_secs(30))
    }

    /// As [`TransportClient::connect`], with an explicit per-call timeout.
    pub fn connect_with_timeout(
        addr: SocketAddr,
        token: String,
        client_type: String,
        version: String,
        call_timeout: Duration,
    ) -> Self {
        let (connection_events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (notifications, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            addr,
            token,
            client_type,
            version,
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
            writer: Mutex::new(None),
            call_timeout,
            connection_events,
            notifications,
        });

        let background = shared.clone();
        tokio::spawn(async move { reconnect_loop(background).await });

        Self { shared }
    }

    /// Subscribe to connection lifecycle events.
    pub fn subscribe_connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.connection_events.subscribe()
    }

    /// Subscribe to server-pushed notifications (e.g. `chat.response`,
    /// `approval.request`), delivered as `(method, params)`.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<(String, Value)> {
        self.shared.notifications.subscribe()
    }

    /// Issue a JSON-RPC call and await its response, failing with
    /// [`TransportClientError::Disconnected`] if the socket drops first
    /// and [`TransportClientError::Timeout`] if nothing arrives in time.
    pub async fn call<P: Serialize, R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, TransportClientError> {
        let value = self.call_raw(method, serde_json::to_value(params)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// As [`TransportClient::call`], without the result's shape known
    /// statically.
    pub async fn call_raw(&self, method: &str, params: Value) -> Result<Value, TransportClientError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let mut line = frame.to_string();
        line.push('\n');

        {
            let writer = self.shared.writer.lock().await;
            match writer.as_ref() {
                Some(tx) if tx.send(line).is_ok() => {}
                _ => {
                    self.shared.pending.lock().await.remove(&id);
                    return Err(TransportClientError::Disconnected);
                }
            }
        }

        match tokio::time::timeout(self.shared.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportClientError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(TransportClientError::Timeout)
            }
        }
    }

    /// Convenience wrapper over `auth.pair`.
    pub async fn pair(&self, user_id: &str, ttl: Duration) -> Result<Value, TransportClientError> {
        self.call_raw(
            "auth.pair",
            serde_json::to_value(PairParams {
                user_id: user_id.to_string(),
                ttl_secs: ttl.as_secs(),
            })?,
        )
        .await
    }

    /// Convenience wrapper over `auth.approve_pairing`.
    pub async fn approve_pairing(&self, code: &str) -> Result<Value, TransportClientError> {
        self.call_raw(
            "auth.approve_pairing",
            serde_json::to_value(ApprovePairingParams { code: code.to_string() })?,
        )
        .await
    }
}

/// Connect, hold the connection until it drops, then back off and retry
/// forever. Never returns; the client's background task is abandoned
/// when every [`TransportClient`] handle is dropped, since the `Arc`
/// keeping `shared` alive goes with it.
async fn reconnect_loop(shared: Arc<Shared>) {
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut attempt: u32 = 0;

    loop {
        match run_connection(&shared).await {
            Ok(()) => {
                backoff_ms = INITIAL_BACKOFF_MS;
                attempt = 0;
            }
            Err(err) => {
                tracing::debug!(error = %err, "transport client connection failed");
            }
        }

        let _ = shared.connection_events.send(ConnectionEvent::Disconnected);
        fail_all_pending(&shared).await;
        *shared.writer.lock().await = None;

        attempt += 1;
        let _ = shared.connection_events.send(ConnectionEvent::Reconnecting { attempt, backoff_ms });
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms = backoff_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
    }
}

/// Connect once, perform the handshake, then pump frames until the
/// socket closes or a read fails.
async fn run_connection(shared: &Arc<Shared>) -> Result<(), TransportClientError> {
    let stream = TcpStream::connect(shared.addr).await?;
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (write_tx, mut write_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = write_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let handshake_id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let (handshake_tx, handshake_rx) = oneshot::channel();
    shared.pending.lock().await.insert(handshake_id, handshake_tx);

    let connect_frame = serde_json::json!({
        "jsonrpc": "2.0",
        "id": handshake_id,
        "method": "connect",
        "params": {
            "client_type": shared.client_type,
            "version": shared.version,
            "token": shared.token,
        },
    });
    let mut connect_line = connect_frame.to_string();
    connect_line.push('\n');
    if write_tx.send(connect_line).is_err() {
        writer_task.abort();
        return Err(TransportClientError::Disconnected);
    }

    let mut handshake_line = String::new();
    reader.read_line(&mut handshake_line).await?;
    if handshake_line.trim().is_empty() {
        writer_task.abort();
        return Err(TransportClientError::Disconnected);
    }
    deliver_frame(shared, &handshake_line).await;
    match handshake_rx.await {
        Ok(Ok(_)) => {}
        Ok(Err(err)) => {
            writer_task.abort();
            return Err(err);
        }
        Err(_) => {
            writer_task.abort();
            return Err(TransportClientError::Disconnected);
        }
    }

    *shared.writer.lock().await = Some(write_tx);
    let _ = shared.connection_events.send(ConnectionEvent::Connected);

    let mut line = String::new();
    loop {
        line.clear();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            writer_task.abort();
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        deliver_frame(shared, &line).await;
    }
}

/// Parse one inbound line and either resolve a pending call or forward a
/// server-pushed notification to subscribers.
async fn deliver_frame(shared: &Arc<Shared>, line: &str) {
    let frame: InboundFrame = match serde_json::from_str(line.trim()) {
        Ok(f) => f,
        Err(err) => {
            tracing::debug!(error = %err, "dropping malformed frame from gateway");
            return;
        }
    };

    let Some(id_value) = frame.id.clone() else {
        if let Some(method) = frame.method {
            let _ = shared.notifications.send((method, frame.params.unwrap_or(Value::Null)));
        }
        return;
    };

    let Some(id) = id_value.as_i64() else {
        return;
    };

    let Some(sender) = shared.pending.lock().await.remove(&id) else {
        return;
    };

    let outcome = if let Some(error) = frame.error {
        Err(TransportClientError::Rpc {
            code: error.code,
            message: error.message,
            data: error.data,
        })
    } else {
        Ok(frame.result.unwrap_or(Value::Null))
    };
    let _ = sender.send(outcome);
}

/// Fail every outstanding call uniformly once the connection is known
/// lost (spec §4.1: "cancel all outstanding pending request futures").
async fn fail_all_pending(shared: &Arc<Shared>) {
    let mut pending = shared.pending.lock().await;
    for (_, sender) in pending.drain() {
        let _ = sender.send(Err(TransportClientError::Disconnected));
    }
}
