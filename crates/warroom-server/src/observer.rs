//! WebSocket client as a broadcast observer, plus the per-connection loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use warroom_core::identity::Identity;
use warroom_engine::{Observer, TransportError};

use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Write half of a socket shared by hub deliveries and RPC replies.
pub struct WsObserver {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    open: AtomicBool,
    cancel: CancellationToken,
}

impl WsObserver {
    pub fn new(sink: SplitSink<WebSocket, Message>, cancel: CancellationToken) -> Self {
        Self {
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
            cancel,
        }
    }

    pub async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.write(Message::Text(text.into())).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.write(Message::Ping(Bytes::new())).await
    }

    async fn write(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let result = self.sink.lock().await.send(message).await;
        result.map_err(|e| {
            self.close();
            TransportError::Write(e.to_string())
        })
    }
}

#[async_trait]
impl Observer for WsObserver {
    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        let text = String::from_utf8(payload.to_vec())
            .map_err(|e| TransportError::Write(e.to_string()))?;
        self.send_text(text).await
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed) && !self.cancel.is_cancelled()
    }

    fn close(&self) {
        self.open.store(false, Ordering::Relaxed);
        self.cancel.cancel();
    }
}

/// Parse and dispatch one text frame. Storage work runs on the blocking pool.
pub async fn handle_text(
    state: &Arc<HandlerState>,
    text: &str,
    caller: Option<&Identity>,
) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(text) {
        Ok(req) => req,
        Err(_) => return RpcResponse::parse_error(),
    };
    let state = Arc::clone(state);
    let caller = caller.cloned();
    let id = request.id.clone();
    let params = request.params.unwrap_or_else(|| serde_json::json!({}));
    let method = request.method;

    debug!(method = %method, "rpc request");
    tokio::task::spawn_blocking(move || {
        handlers::dispatch(&state, &method, &params, caller.as_ref(), request.id)
    })
    .await
    .unwrap_or_else(|e| RpcResponse::internal_error(id, format!("handler failed: {e}")))
}

/// Drive one connection until the client leaves, goes silent, or the hub
/// drops it. The socket is registered as an observer for its whole life.
#[instrument(skip_all, fields(identity = caller.as_ref().map(|c| c.email.as_str()).unwrap_or("anonymous")))]
pub async fn run_connection(socket: WebSocket, state: Arc<HandlerState>, caller: Option<Identity>) {
    let (sink, mut stream) = socket.split();
    let cancel = CancellationToken::new();
    let observer = Arc::new(WsObserver::new(sink, cancel.clone()));
    let hub = Arc::clone(state.coordinator.hub());
    let observer_id = hub.register_observer(observer.clone());
    info!(observer_id = %observer_id, "client connected");

    let mut last_seen = Instant::now();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= CLIENT_TIMEOUT {
                    info!(observer_id = %observer_id, "client unresponsive, disconnecting");
                    break;
                }
                if observer.ping().await.is_err() {
                    break;
                }
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(s) => s.to_owned(),
                        Err(_) => {
                            last_seen = Instant::now();
                            continue;
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = Instant::now();
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                };
                last_seen = Instant::now();

                let response = handle_text(&state, &text, caller.as_ref()).await;
                match serde_json::to_string(&response) {
                    Ok(json) => {
                        if observer.send_text(json).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "failed to serialize rpc response"),
                }
            }
        }
    }

    let _ = hub.remove_observer(&observer_id);
    info!(observer_id = %observer_id, "client disconnected");
}
