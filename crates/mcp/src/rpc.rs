//! Request/response correlation shared by the stream-based transports.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use {
    tokio::sync::{Mutex, oneshot},
    tokio_util::sync::CancellationToken,
    tracing::{debug, warn},
};

use crate::{
    error::{McpTransportError, Result},
    traits::{TransportEvent, TransportEventSender},
    types::{IncomingMessage, JsonRpcRequest, JsonRpcResponse},
};

/// Requests awaiting a response, keyed by JSON-RPC id.
pub(crate) struct PendingRequests {
    next_id: AtomicU64,
    waiting: Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate an id, build the request and register interest in its answer.
    pub(crate) async fn register(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> (JsonRpcRequest, oneshot::Receiver<JsonRpcResponse>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().await.insert(req.id_key(), tx);
        (req, rx)
    }

    pub(crate) async fn forget(&self, id_key: &str) {
        self.waiting.lock().await.remove(id_key);
    }

    pub(crate) async fn resolve(&self, resp: JsonRpcResponse) {
        let key = resp.id.to_string();
        let mut map = self.waiting.lock().await;
        if let Some(tx) = map.remove(&key) {
            let _ = tx.send(resp);
        } else {
            warn!(id = %key, "received response for unknown request id");
        }
    }

    /// Drop every waiter so their callers see the transport as closed.
    pub(crate) async fn fail_all(&self) {
        self.waiting.lock().await.clear();
    }

    /// Wait for the answer to `req`, bounded by `timeout` and `cancel`.
    pub(crate) async fn wait(
        &self,
        req: &JsonRpcRequest,
        rx: oneshot::Receiver<JsonRpcResponse>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<JsonRpcResponse> {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(McpTransportError::Closed),
            res = tokio::time::timeout(timeout, rx) => match res {
                Ok(Ok(resp)) => Ok(resp),
                Ok(Err(_)) => Err(McpTransportError::Closed),
                Err(_) => Err(McpTransportError::Timeout {
                    method: req.method.clone(),
                    timeout_ms: timeout.as_millis(),
                }),
            },
        };

        if outcome.is_err() {
            self.forget(&req.id_key()).await;
        }
        Ok(check_response(&req.method, outcome?)?)
    }
}

/// Turn a JSON-RPC error payload into a typed failure.
pub(crate) fn check_response(
    method: &str,
    resp: JsonRpcResponse,
) -> std::result::Result<JsonRpcResponse, McpTransportError> {
    if let Some(err) = &resp.error {
        return Err(McpTransportError::Rpc {
            method: method.to_string(),
            code: err.code,
            message: err.message.clone(),
        });
    }
    Ok(resp)
}

/// Route one raw payload from the server: responses complete a pending
/// request, notifications go out on the event channel.
pub(crate) async fn dispatch_incoming(
    raw: &str,
    pending: &PendingRequests,
    events: &TransportEventSender,
) {
    match IncomingMessage::parse(raw) {
        Some(IncomingMessage::Response(resp)) => pending.resolve(resp).await,
        Some(IncomingMessage::Notification(notif)) => {
            let _ = events.send(TransportEvent::Notification(notif));
        },
        None => debug!(line = %raw, "MCP server sent unrecognized message"),
    }
}
