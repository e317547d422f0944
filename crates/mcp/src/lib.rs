//! Supervised connections to MCP (Model Context Protocol) servers.
//!
//! This crate provides:
//! - JSON-RPC 2.0 over stdio, SSE and streamable HTTP (`transport`,
//!   `sse_transport`, `http_transport`)
//! - MCP client for the protocol handshake, discovery and invocation (`client`)
//! - The settings file gateway (`settings`) and server definitions (`config`)
//! - The reconciling connection hub (`hub`) with file watchers (`watcher`) and
//!   notification routing (`notifications`)

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod factory;
pub mod http_transport;
pub mod hub;
pub mod notifications;
pub mod observer;
pub(crate) mod rpc;
pub mod settings;
pub mod sse;
pub mod sse_transport;
pub mod traits;
pub mod transport;
pub mod types;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use {
    client::{McpClient, McpClientState},
    config::{McpServerConfig, TransportConfig, TransportKind},
    connection::{ConnectionStatus, McpServer, McpTool},
    error::{Error, McpManagerError, McpTransportError, Result},
    factory::DefaultTransportFactory,
    hub::{HubOptions, McpHub},
    notifications::{NotificationConsumer, ServerNotification},
    observer::{HubObserver, NoopObserver, StatusLevel},
    settings::{McpSettings, SettingsStore},
    traits::{McpTransport, TransportEvent, TransportFactory},
};
