//! Trait abstractions for the transport layer.
//!
//! The hub never names a concrete transport: it asks a [`TransportFactory`]
//! for an [`McpTransport`] and listens on the [`TransportEvent`] channel that
//! was handed to the factory.

use std::{sync::Arc, time::Duration};

use {async_trait::async_trait, serde_json::Value, tokio::sync::mpsc};

use crate::{
    config::McpServerConfig,
    error::Result,
    types::{JsonRpcNotification, JsonRpcResponse},
};

/// Something that happened on a transport outside of a request/response.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport failed. It may or may not still be usable.
    Error(String),
    /// The underlying process or stream ended.
    Closed,
    /// One line of the child's standard error (stdio only).
    Stderr(String),
    /// A server-initiated JSON-RPC notification.
    Notification(JsonRpcNotification),
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Transport layer for MCP communication (JSON-RPC).
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Open the process or connection. Called once, before any request.
    async fn start(&self) -> Result<()>;

    /// Send a JSON-RPC request and wait up to `timeout` for the response.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse>;

    /// Send a JSON-RPC notification (no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Close the transport, failing any in-flight requests.
    async fn close(&self) -> Result<()>;
}

/// Builds the transport for a server definition.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        server_name: &str,
        config: &McpServerConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn McpTransport>>;
}
