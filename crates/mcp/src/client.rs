//! MCP client: the protocol handshake plus discovery and invocation against a
//! single server, over any [`McpTransport`].

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    serde::de::DeserializeOwned,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Context, Error, Result},
    traits::McpTransport,
    types::{
        ClientCapabilities, ClientInfo, InitializeParams, InitializeResult, McpResource,
        McpResourceTemplate, McpToolDef, PROTOCOL_VERSION, ResourceReadParams,
        ResourceReadResult, ResourceTemplatesListResult, ResourcesListResult, ToolsCallParams,
        ToolsCallResult, ToolsListResult,
    },
};

/// State of an MCP client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpClientState {
    /// Transport started, not yet initialized.
    Connected,
    /// `initialize` completed, `initialized` notification sent.
    Ready,
    /// Closed by the hub.
    Closed,
}

/// An MCP client bound to one server.
pub struct McpClient {
    server_name: String,
    transport: Arc<dyn McpTransport>,
    request_timeout: Duration,
    state: Mutex<McpClientState>,
    server_info: Option<InitializeResult>,
}

impl McpClient {
    /// Start the transport and perform the MCP handshake (initialize + initialized).
    ///
    /// On failure the transport is closed before the error is returned.
    pub async fn connect(
        server_name: &str,
        transport: Arc<dyn McpTransport>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut client = Self {
            server_name: server_name.into(),
            transport,
            request_timeout,
            state: Mutex::new(McpClientState::Connected),
            server_info: None,
        };

        let handshake = match client.transport.start().await {
            Ok(()) => client.initialize().await,
            Err(e) => Err(e),
        };
        if let Err(e) = handshake {
            warn!(server = %server_name, error = %e, "MCP initialize handshake failed");
            if let Err(close_err) = client.transport.close().await {
                debug!(
                    server = %server_name,
                    error = %close_err,
                    "failed to close transport after handshake error"
                );
            }
            return Err(e);
        }
        Ok(client)
    }

    async fn initialize(&mut self) -> Result<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo {
                name: env!("CARGO_PKG_NAME").into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let result: InitializeResult = self
            .request("initialize", Some(serde_json::to_value(&params)?), None)
            .await
            .context("MCP initialize request failed")?;

        info!(
            server = %self.server_name,
            protocol = %result.protocol_version,
            server_name = %result.server_info.name,
            "MCP server initialized"
        );
        self.server_info = Some(result);

        self.transport
            .notify("notifications/initialized", None)
            .await?;
        self.set_state(McpClientState::Ready);
        Ok(())
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.as_ref()
    }

    pub fn state(&self) -> McpClientState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: McpClientState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = self.state();
        if state != McpClientState::Ready {
            return Err(Error::message(format!(
                "MCP client for '{}' is not ready (state: {state:?})",
                self.server_name
            )));
        }
        Ok(())
    }

    /// Send a request and decode its `result`. `timeout` defaults to the
    /// client's request timeout.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let resp = self
            .transport
            .request(method, params, timeout.unwrap_or(self.request_timeout))
            .await?;
        let result = resp
            .result
            .with_context(|| format!("{method} returned no result"))?;
        serde_json::from_value(result)
            .map_err(|e| Error::external(format!("failed to parse {method} result"), e))
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDef>> {
        self.ensure_ready()?;
        let result: ToolsListResult = self.request("tools/list", None, None).await?;
        debug!(server = %self.server_name, count = result.tools.len(), "fetched MCP tools");
        Ok(result.tools)
    }

    pub async fn list_resources(&self) -> Result<Vec<McpResource>> {
        self.ensure_ready()?;
        let result: ResourcesListResult = self.request("resources/list", None, None).await?;
        debug!(server = %self.server_name, count = result.resources.len(), "fetched MCP resources");
        Ok(result.resources)
    }

    pub async fn list_resource_templates(&self) -> Result<Vec<McpResourceTemplate>> {
        self.ensure_ready()?;
        let result: ResourceTemplatesListResult = self
            .request("resources/templates/list", None, None)
            .await?;
        Ok(result.resource_templates)
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<ToolsCallResult> {
        self.ensure_ready()?;
        let params = ToolsCallParams {
            name: name.into(),
            arguments,
        };
        self.request("tools/call", Some(serde_json::to_value(&params)?), Some(timeout))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult> {
        self.ensure_ready()?;
        let params = ResourceReadParams { uri: uri.into() };
        self.request("resources/read", Some(serde_json::to_value(&params)?), None)
            .await
    }

    /// Close the underlying transport. In-flight requests fail.
    pub async fn close(&self) -> Result<()> {
        self.set_state(McpClientState::Closed);
        self.transport.close().await
    }
}
