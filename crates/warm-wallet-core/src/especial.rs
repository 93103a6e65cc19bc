// Especial RPC client: JSON request/response frames over a WebSocket.
//
// Requests are `{"func", "data", "_rid"}` text frames. Replies carry the same
// `_rid` plus `status` (0 on success), `data`, and an optional `message`. A
// background reader task routes replies to the waiting caller by id and
// flips the client to disconnected when the socket goes away.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::session::{Connector, SessionError, SessionTransport};

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Reply>>>>;

#[derive(Debug, Serialize)]
struct Request<'a> {
    func: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(rename = "_rid")]
    id: String,
}

/// A reply frame from the server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Reply {
    /// Request id echoed back by the server. Plain `id` is accepted too.
    #[serde(default, rename = "_rid", alias = "id")]
    pub id: Option<String>,
    #[serde(default)]
    pub func: Option<String>,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub message: Option<String>,
}

pub struct EspecialClient {
    url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    connected: Arc<AtomicBool>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending: Pending,
    next_id: AtomicU64,
}

impl EspecialClient {
    pub fn new(url: impl Into<String>, connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
            request_timeout,
            connected: Arc::new(AtomicBool::new(false)),
            outbound: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Register a waiter for the reply to `id`.
    ///
    /// The liveness check and the insert happen under the lock the reader
    /// takes in [`mark_closed`], so a waiter is never registered after the
    /// waiters have been cleared.
    fn register(&self, id: &str) -> Result<oneshot::Receiver<Reply>, SessionError> {
        let mut pending = self.pending.lock().expect("especial pending mutex poisoned");
        if !self.is_connected() {
            return Err(SessionError::Closed);
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(id.to_string(), tx);
        Ok(rx)
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.outbound
            .lock()
            .expect("especial outbound mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl SessionTransport for EspecialClient {
    async fn connect(&self) -> Result<(), SessionError> {
        if self.is_connected() {
            return Ok(());
        }

        let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SessionError::Timeout(format!("connect to {}", self.url)))?
            .map_err(|source| SessionError::Connect {
                url: self.url.clone(),
                source,
            })?;

        let (mut write, read) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(msg).await {
                    warn!(%url, error = %e, "especial write failed");
                    break;
                }
            }
        });

        // Mark live before the reader starts so an immediate close is not
        // overwritten.
        *self.outbound.lock().expect("especial outbound mutex poisoned") = Some(tx);
        self.connected.store(true, Ordering::SeqCst);

        let url = self.url.clone();
        let pending = Arc::clone(&self.pending);
        let connected = Arc::clone(&self.connected);
        tokio::spawn(async move {
            route_replies(read, &pending, &url).await;
            mark_closed(&connected, &pending);
            info!(%url, "especial connection closed");
        });

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, func: &str, data: Option<Value>) -> Result<Value, SessionError> {
        if !self.is_connected() {
            return Err(SessionError::NotConnected(self.url.clone()));
        }
        let outbound = self
            .outbound()
            .ok_or_else(|| SessionError::NotConnected(self.url.clone()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let text = serde_json::to_string(&Request {
            func,
            data,
            id: id.clone(),
        })?;

        let reply_rx = self.register(&id)?;

        if outbound.send(Message::Text(text.into())).is_err() {
            self.pending
                .lock()
                .expect("especial pending mutex poisoned")
                .remove(&id);
            return Err(SessionError::Closed);
        }

        let reply = match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SessionError::Closed),
            Err(_) => {
                self.pending
                    .lock()
                    .expect("especial pending mutex poisoned")
                    .remove(&id);
                return Err(SessionError::Timeout(format!("reply to `{func}`")));
            }
        };

        if reply.status != 0 {
            return Err(SessionError::Remote {
                func: func.to_string(),
                message: reply
                    .message
                    .unwrap_or_else(|| format!("status {}", reply.status)),
            });
        }
        Ok(reply.data)
    }
}

/// Flip the client to disconnected and drop every waiter, which wakes each
/// pending `send` with `Closed`.
fn mark_closed(connected: &AtomicBool, pending: &Pending) {
    let mut pending = pending.lock().expect("especial pending mutex poisoned");
    connected.store(false, Ordering::SeqCst);
    pending.clear();
}

/// Read frames from `stream` until it closes, handing each reply to the
/// waiter registered under its id.
///
/// Generic over the stream so it can be driven by an in-memory stream in
/// tests.
pub(crate) async fn route_replies<St>(mut stream: St, pending: &Pending, url: &str)
where
    St: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                let reply: Reply = match serde_json::from_str(text.as_str()) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(url, error = %e, "ignoring malformed especial frame");
                        continue;
                    }
                };
                let Some(id) = reply.id.clone() else {
                    debug!(url, func = ?reply.func, "ignoring unsolicited especial frame");
                    continue;
                };
                let waiter = pending
                    .lock()
                    .expect("especial pending mutex poisoned")
                    .remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(url, %id, "no waiter for especial reply"),
                }
            }
            Ok(Message::Close(_)) => {
                info!(url, "server sent close frame");
                break;
            }
            Err(e) => {
                warn!(url, error = %e, "especial socket error");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
}

/// [`Connector`] that builds [`EspecialClient`]s with fixed timeouts.
pub struct WsConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl Connector for WsConnector {
    fn transport_for(&self, url: &str) -> Arc<dyn SessionTransport> {
        Arc::new(EspecialClient::new(
            url,
            self.connect_timeout,
            self.request_timeout,
        ))
    }
}
