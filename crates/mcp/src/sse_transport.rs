//! Server-Sent-Events transport for remote MCP servers.
//!
//! The client holds a long-lived `GET` event stream. The server first sends an
//! `endpoint` event naming the URL that JSON-RPC messages must be POSTed to;
//! responses and notifications then arrive as `message` events on the stream.
//! A dropped stream is reported and re-opened with capped exponential backoff
//! until the transport is closed.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use {
    futures::StreamExt,
    reqwest::{
        Client, Response,
        header::{ACCEPT, HeaderMap, HeaderName, HeaderValue},
    },
    tokio::{
        sync::{Mutex, watch},
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    error::{Context, Error, McpTransportError, Result},
    rpc::{PendingRequests, dispatch_incoming},
    sse::SseDecoder,
    traits::{McpTransport, TransportEvent, TransportEventSender},
    types::{JsonRpcNotification, JsonRpcResponse},
};

const INITIAL_RETRY: Duration = Duration::from_millis(500);
const MAX_RETRY: Duration = Duration::from_secs(5);
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const POST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the header map sent on every request to a remote server.
pub(crate) fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (key, value) in headers {
        let name = HeaderName::try_from(key.as_str())
            .map_err(|e| Error::external(format!("invalid header name '{key}'"), e))?;
        let value = HeaderValue::try_from(value.as_str())
            .map_err(|e| Error::external(format!("invalid value for header '{key}'"), e))?;
        map.insert(name, value);
    }
    Ok(map)
}

/// State shared between the transport and its stream listener task.
struct Shared {
    url: Url,
    client: Client,
    events: TransportEventSender,
    pending: PendingRequests,
    endpoint: watch::Sender<Option<Url>>,
    cancel: CancellationToken,
}

/// Event-stream backed transport.
pub struct SseTransport {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SseTransport {
    pub fn new(
        url: &str,
        headers: &BTreeMap<String, String>,
        events: TransportEventSender,
    ) -> Result<Self> {
        let url = Url::parse(url)?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .default_headers(header_map(headers)?)
            .build()
            .context("failed to build HTTP client for SSE transport")?;
        let (endpoint, _) = watch::channel(None);

        Ok(Self {
            shared: Arc::new(Shared {
                url,
                client,
                events,
                pending: PendingRequests::new(),
                endpoint,
                cancel: CancellationToken::new(),
            }),
            listener: Mutex::new(None),
        })
    }

    async fn post(&self, method: &str, body: &impl serde::Serialize) -> Result<()> {
        let endpoint = self
            .shared
            .endpoint
            .borrow()
            .clone()
            .ok_or(McpTransportError::NotStarted)?;

        let resp = self
            .shared
            .client
            .post(endpoint)
            .timeout(POST_TIMEOUT)
            .json(body)
            .send()
            .await
            .with_context(|| format!("SSE POST for '{method}' failed"))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(McpTransportError::Http {
                method: method.to_string(),
                status,
                body,
            }
            .into());
        }
        Ok(())
    }
}

impl Shared {
    async fn open_stream(&self) -> Result<Response> {
        let resp = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(McpTransportError::Http {
                method: "GET".into(),
                status,
                body,
            }
            .into());
        }
        Ok(resp)
    }

    /// Consume one stream until it ends. Returns why it ended.
    async fn read_stream(&self, resp: Response) -> String {
        let mut stream = resp.bytes_stream();
        let mut decoder = SseDecoder::new();

        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => return "closed".into(),
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    for event in decoder.feed(&bytes) {
                        self.handle_event(&event.event, &event.data).await;
                    }
                },
                Some(Err(e)) => return format!("SSE stream error: {e}"),
                None => return "SSE stream ended".into(),
            }
        }
    }

    async fn handle_event(&self, event: &str, data: &str) {
        match event {
            "endpoint" => match self.url.join(data.trim()) {
                Ok(endpoint) => {
                    debug!(url = %self.url, endpoint = %endpoint, "SSE endpoint received");
                    self.endpoint.send_replace(Some(endpoint));
                },
                Err(e) => warn!(url = %self.url, error = %e, "invalid SSE endpoint"),
            },
            "message" => dispatch_incoming(data, &self.pending, &self.events).await,
            other => debug!(event = %other, "ignoring SSE event"),
        }
    }

    /// Keep the event stream open until cancelled, re-opening it after drops.
    async fn listen(self: Arc<Self>, first: Response) {
        let mut next = Some(first);
        let mut retry = INITIAL_RETRY;

        loop {
            let opened = match next.take() {
                Some(resp) => Ok(resp),
                None => self.open_stream().await,
            };

            match opened {
                Ok(resp) => {
                    retry = INITIAL_RETRY;
                    let reason = self.read_stream(resp).await;
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    // Answers for the old session will never arrive.
                    self.pending.fail_all().await;
                    warn!(url = %self.url, reason = %reason, "SSE stream dropped, reconnecting");
                    let _ = self.events.send(TransportEvent::Error(reason));
                },
                Err(e) => {
                    warn!(url = %self.url, error = %e, "SSE reconnect failed");
                    let _ = self.events.send(TransportEvent::Error(e.to_string()));
                },
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(retry) => {},
            }
            retry = (retry * 2).min(MAX_RETRY);
        }
        debug!(url = %self.url, "SSE listener stopped");
    }
}

#[async_trait::async_trait]
impl McpTransport for SseTransport {
    async fn start(&self) -> Result<()> {
        info!(url = %self.shared.url, "opening SSE stream");
        let first = self.shared.open_stream().await?;

        let mut endpoint = self.shared.endpoint.subscribe();
        let handle = tokio::spawn(Arc::clone(&self.shared).listen(first));
        *self.listener.lock().await = Some(handle);

        let ready = tokio::time::timeout(
            ENDPOINT_TIMEOUT,
            endpoint.wait_for(|endpoint| endpoint.is_some()),
        )
        .await;
        match ready {
            Ok(Ok(_)) => Ok(()),
            _ => Err(McpTransportError::MissingEndpoint.into()),
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        if self.shared.cancel.is_cancelled() {
            return Err(McpTransportError::Closed.into());
        }
        let (req, rx) = self.shared.pending.register(method, params).await;
        debug!(method = %method, id = %req.id, url = %self.shared.url, "SSE client -> server");

        if let Err(e) = self.post(method, &req).await {
            self.shared.pending.forget(&req.id_key()).await;
            return Err(e);
        }
        self.shared
            .pending
            .wait(&req, rx, timeout, &self.shared.cancel)
            .await
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        self.post(method, &notif).await
    }

    async fn close(&self) -> Result<()> {
        self.shared.cancel.cancel();
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        self.shared.pending.fail_all().await;
        self.shared.endpoint.send_replace(None);
        Ok(())
    }
}
