//! Connection records owned by the hub, and the snapshots handed to callers.

use std::{fmt, sync::Arc};

use {
    serde::{Deserialize, Serialize},
    tokio::task::JoinHandle,
};

use crate::{
    client::McpClient,
    config::McpServerConfig,
    types::{McpResource, McpResourceTemplate, McpToolDef},
};

/// Live status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        })
    }
}

/// One registry entry. Only the hub holds these.
pub(crate) struct Connection {
    pub name: String,
    pub config: McpServerConfig,
    /// Config that produced the current transport, compared structurally.
    pub snapshot: serde_json::Value,
    pub status: ConnectionStatus,
    pub disabled: bool,
    pub error: String,
    pub tools: Vec<McpToolDef>,
    pub resources: Vec<McpResource>,
    pub resource_templates: Vec<McpResourceTemplate>,
    pub client: Option<Arc<McpClient>>,
    /// Distinguishes this incarnation from earlier ones with the same name,
    /// so late transport events from a replaced connection are ignored.
    pub generation: u64,
    pub pump: Option<JoinHandle<()>>,
}

impl Connection {
    pub(crate) fn new(name: &str, config: McpServerConfig, generation: u64) -> Self {
        let disabled = config.disabled;
        Self {
            name: name.to_string(),
            snapshot: config.snapshot(),
            config,
            status: if disabled {
                ConnectionStatus::Disconnected
            } else {
                ConnectionStatus::Connecting
            },
            disabled,
            error: String::new(),
            tools: Vec::new(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
            client: None,
            generation,
            pump: None,
        }
    }

    pub(crate) fn append_error(&mut self, text: &str) {
        if self.error.is_empty() {
            self.error = text.to_string();
        } else {
            self.error.push('\n');
            self.error.push_str(text);
        }
    }

    /// Copy out a snapshot. `live` is the entry currently in the settings
    /// file, which decides tool auto-approval when present.
    pub(crate) fn to_server(&self, live: Option<&McpServerConfig>) -> McpServer {
        let approvals = live.unwrap_or(&self.config);
        McpServer {
            name: self.name.clone(),
            config: self.snapshot.clone(),
            status: self.status,
            disabled: self.disabled,
            error: (!self.error.is_empty()).then(|| self.error.clone()),
            tools: self
                .tools
                .iter()
                .map(|def| McpTool {
                    auto_approve: approvals.is_auto_approved(&def.name),
                    def: def.clone(),
                })
                .collect(),
            resources: self.resources.clone(),
            resource_templates: self.resource_templates.clone(),
            timeout: approvals.timeout,
        }
    }
}

/// A discovered tool with its derived approval flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpTool {
    #[serde(flatten)]
    pub def: McpToolDef,
    pub auto_approve: bool,
}

/// Point-in-time view of one connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServer {
    pub name: String,
    pub config: serde_json::Value,
    pub status: ConnectionStatus,
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tools: Vec<McpTool>,
    pub resources: Vec<McpResource>,
    pub resource_templates: Vec<McpResourceTemplate>,
    pub timeout: u64,
}
