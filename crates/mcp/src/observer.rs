//! Outbound side of the hub: whoever renders server lists and status lines.

use serde::Serialize;

use crate::{connection::McpServer, error::Result, notifications::ServerNotification};

/// Severity of a one-line status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Receives hub output. All methods are called from hub tasks and must not
/// block.
pub trait HubObserver: Send + Sync {
    /// The ordered server list changed.
    fn publish_server_snapshot(&self, _servers: &[McpServer]) {}

    fn show_status(&self, _level: StatusLevel, _message: &str) {}

    /// Secondary delivery of a peer notification. Errors are logged by the
    /// hub and never affect routing to the active consumer.
    fn forward_notification(&self, _notification: &ServerNotification) -> Result<()> {
        Ok(())
    }
}

/// Observer that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl HubObserver for NoopObserver {}
