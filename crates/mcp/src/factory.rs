//! Transport selection for a server definition.

use std::sync::Arc;

use tracing::debug;

use crate::{
    config::{McpServerConfig, TransportConfig},
    error::Result,
    http_transport::StreamableHttpTransport,
    sse_transport::SseTransport,
    traits::{McpTransport, TransportEventSender, TransportFactory},
    transport::{StdioParams, StdioTransport},
};

/// Builds the real transport matching the configured kind.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        server_name: &str,
        config: &McpServerConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn McpTransport>> {
        debug!(server = %server_name, transport = %config.kind(), "creating MCP transport");
        Ok(match &config.transport {
            TransportConfig::Stdio {
                command,
                args,
                cwd,
                env,
            } => Arc::new(StdioTransport::new(
                StdioParams {
                    command: command.clone(),
                    args: args.clone(),
                    cwd: cwd.clone(),
                    env: env.clone(),
                },
                events,
            )),
            TransportConfig::Sse { url, headers } => {
                Arc::new(SseTransport::new(url, headers, events)?)
            },
            TransportConfig::StreamableHttp { url, headers } => {
                Arc::new(StreamableHttpTransport::new(url, headers, events)?)
            },
        })
    }
}
