//! Streamable HTTP transport for remote MCP servers.
//!
//! Every JSON-RPC message is a `POST`; the server answers with either a JSON
//! body or a short event stream. There is no reconnection: failed requests are
//! reported as transport errors.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use {
    reqwest::Client,
    tokio::sync::RwLock,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    error::{Context, Error, McpTransportError, Result},
    rpc::check_response,
    sse::parse_event_stream,
    sse_transport::header_map,
    traits::{McpTransport, TransportEvent, TransportEventSender},
    types::{
        IncomingMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
    },
};

const MCP_PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";
const MCP_SESSION_ID_HEADER: &str = "Mcp-Session-Id";
const STREAMABLE_ACCEPT_HEADER: &str = "application/json, text/event-stream";
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

/// Streamable HTTP transport.
pub struct StreamableHttpTransport {
    client: Client,
    url: Url,
    events: TransportEventSender,
    next_id: AtomicU64,
    started: AtomicBool,
    /// Session identifier assigned by the server, if any.
    session_id: RwLock<Option<String>>,
    cancel: CancellationToken,
}

impl StreamableHttpTransport {
    pub fn new(
        url: &str,
        headers: &BTreeMap<String, String>,
        events: TransportEventSender,
    ) -> Result<Self> {
        let url = Url::parse(url)?;
        let client = Client::builder()
            .default_headers(header_map(headers)?)
            .build()
            .context("failed to build HTTP client for streamable HTTP transport")?;

        Ok(Self {
            client,
            url,
            events,
            next_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            session_id: RwLock::new(None),
            cancel: CancellationToken::new(),
        })
    }

    async fn build_post(&self, timeout: Duration) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(self.url.clone())
            .timeout(timeout)
            .header("Accept", STREAMABLE_ACCEPT_HEADER)
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION);

        if let Some(session_id) = self.session_id.read().await.clone() {
            req = req.header(MCP_SESSION_ID_HEADER, session_id);
        }
        req
    }

    async fn store_session_id_from_response(&self, response: &reqwest::Response) {
        let Some(session_id) = response
            .headers()
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return;
        };

        let mut slot = self.session_id.write().await;
        if slot.as_deref() != Some(session_id) {
            debug!(url = %self.url, session_id = %session_id, "updated MCP session id");
            *slot = Some(session_id.to_string());
        }
    }

    fn response_is_event_stream(resp: &reqwest::Response) -> bool {
        resp.headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|ct| ct.split(';').next())
            .is_some_and(|base| base.trim() == "text/event-stream")
    }

    /// Pull the response for `req` out of an event-stream body, forwarding
    /// any notifications that precede it.
    fn take_response_from_stream(
        &self,
        body: &str,
        req: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse> {
        let mut found = None;
        for event in parse_event_stream(body) {
            match IncomingMessage::parse(&event.data) {
                Some(IncomingMessage::Response(resp)) if resp.id == req.id => {
                    found = Some(resp);
                },
                Some(IncomingMessage::Notification(notif)) => {
                    let _ = self.events.send(TransportEvent::Notification(notif));
                },
                _ => debug!(data = %event.data, "ignoring event-stream payload"),
            }
        }
        found.with_context(|| format!("no JSON-RPC response in event stream for '{}'", req.method))
    }

    /// Send a POST, reporting connection-level failures on the event channel.
    async fn send(
        &self,
        method: &str,
        body: &impl serde::Serialize,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let send = self.build_post(timeout).await.json(body).send();
        let resp = tokio::select! {
            _ = self.cancel.cancelled() => return Err(McpTransportError::Closed.into()),
            resp = send => resp,
        };

        let resp = match resp {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                return Err(McpTransportError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis(),
                }
                .into());
            },
            Err(e) => {
                let _ = self.events.send(TransportEvent::Error(e.to_string()));
                return Err(Error::external(
                    format!("POST to '{}' for '{method}' failed", self.url),
                    e,
                ));
            },
        };

        self.store_session_id_from_response(&resp).await;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            let err = McpTransportError::Http {
                method: method.to_string(),
                status,
                body,
            };
            let _ = self.events.send(TransportEvent::Error(err.to_string()));
            return Err(err.into());
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(McpTransportError::Closed.into());
        }
        info!(url = %self.url, "using streamable HTTP transport");
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(McpTransportError::NotStarted.into());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let req = JsonRpcRequest::new(id, method, params);
        debug!(method = %method, id = %id, url = %self.url, "HTTP client -> server");

        let http_resp = self.send(method, &req, timeout).await?;

        let resp = if Self::response_is_event_stream(&http_resp) {
            let body = http_resp
                .text()
                .await
                .with_context(|| format!("failed to read event stream response for '{method}'"))?;
            self.take_response_from_stream(&body, &req)?
        } else {
            http_resp
                .json()
                .await
                .with_context(|| format!("failed to parse JSON-RPC response for '{method}'"))?
        };

        Ok(check_response(method, resp)?)
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(McpTransportError::NotStarted.into());
        }
        let notif = JsonRpcNotification::new(method, params);
        debug!(method = %method, url = %self.url, "HTTP client -> server (notification)");
        self.send(method, &notif, NOTIFY_TIMEOUT).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.started.store(false, Ordering::SeqCst);

        let Some(session_id) = self.session_id.write().await.take() else {
            return Ok(());
        };

        let req = self
            .client
            .delete(self.url.clone())
            .timeout(CLOSE_TIMEOUT)
            .header(MCP_PROTOCOL_VERSION_HEADER, PROTOCOL_VERSION)
            .header(MCP_SESSION_ID_HEADER, session_id);

        if let Err(e) = req.send().await {
            warn!(url = %self.url, error = %e, "failed to close MCP streamable HTTP session");
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, tokio::sync::mpsc};

    async fn started(
        url: &str,
    ) -> (StreamableHttpTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = StreamableHttpTransport::new(url, &BTreeMap::new(), tx).unwrap();
        transport.start().await.unwrap();
        (transport, rx)
    }

    const SECS: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_request_unreachable_reports_error_event() {
        let (transport, mut rx) = started("http://127.0.0.1:1/mcp").await;
        assert!(transport.request("test", None, SECS).await.is_err());
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_request_before_start_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport =
            StreamableHttpTransport::new("http://localhost/mcp", &BTreeMap::new(), tx).unwrap();
        let err = transport.request("test", None, SECS).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(McpTransportError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_json_response_with_configured_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .match_header("authorization", "Bearer abc")
            .match_header("mcp-protocol-version", PROTOCOL_VERSION)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#)
            .create_async()
            .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let headers = BTreeMap::from([("Authorization".to_string(), "Bearer abc".to_string())]);
        let transport = StreamableHttpTransport::new(&server.url(), &headers, tx).unwrap();
        transport.start().await.unwrap();
        let resp = transport.request("test", None, SECS).await.unwrap();
        assert!(resp.result.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rpc_error_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"bad args"}}"#)
            .create_async()
            .await;

        let (transport, _rx) = started(&server.url()).await;
        let err = transport.request("tools/call", None, SECS).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(McpTransportError::Rpc { code: -32602, .. })
        ));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(500)
            .with_body("oops")
            .create_async()
            .await;

        let (transport, mut rx) = started(&server.url()).await;
        let err = transport.request("test", None, SECS).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(McpTransportError::Http { status: 500, .. })
        ));
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_event_stream_response_forwards_notifications() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(concat!(
                "event: message\n",
                "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\",\"params\":{\"level\":\"info\",\"data\":\"working\"}}\n\n",
                "event: message\n",
                "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"ok\":true}}\n\n",
            ))
            .create_async()
            .await;

        let (transport, mut rx) = started(&server.url()).await;
        let resp = transport.request("tools/call", None, SECS).await.unwrap();
        assert!(resp.result.is_some());
        match rx.try_recv() {
            Ok(TransportEvent::Notification(n)) => assert_eq!(n.method, "notifications/message"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_propagates_session_id_and_deletes_on_close() {
        let mut server = mockito::Server::new_async().await;
        let first = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("mcp-session-id", "session-123")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#)
            .create_async()
            .await;
        let second = server
            .mock("POST", "/")
            .match_header("mcp-session-id", "session-123")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"jsonrpc":"2.0","id":2,"result":{"ok":true}}"#)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/")
            .match_header("mcp-session-id", "session-123")
            .with_status(204)
            .create_async()
            .await;

        let (transport, _rx) = started(&server.url()).await;
        transport.request("initialize", None, SECS).await.unwrap();
        transport.request("tools/list", None, SECS).await.unwrap();
        transport.close().await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
        delete.assert_async().await;
        assert!(transport.request("tools/list", None, SECS).await.is_err());
    }
}
