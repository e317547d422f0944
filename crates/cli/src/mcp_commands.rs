//! CLI commands for MCP servers.

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::Subcommand,
    tracing::warn,
};

use switchyard_mcp::{
    DefaultTransportFactory, HubObserver, HubOptions, McpHub, McpServer, McpServerConfig,
    ServerNotification, SettingsStore, StatusLevel, TransportKind,
};

#[derive(Subcommand)]
pub enum McpAction {
    /// Connect to every configured server and print their state.
    List,
    /// Call a tool.
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// Read a resource.
    Read { server: String, uri: String },
    /// Stay connected, printing server changes and notifications until Ctrl-C.
    Watch,
    /// Enable a server.
    Enable { server: String },
    /// Disable a server.
    Disable { server: String },
    /// Let tools run without confirmation.
    Approve {
        server: String,
        #[arg(required = true)]
        tools: Vec<String>,
    },
    /// Require confirmation for tools again.
    Unapprove {
        server: String,
        #[arg(required = true)]
        tools: Vec<String>,
    },
    /// Set a server's tool-call timeout in seconds.
    Timeout { server: String, seconds: u64 },
    /// Register a remote server (SSE unless `--streamable`).
    AddRemote {
        name: String,
        url: String,
        #[arg(long)]
        streamable: bool,
    },
    /// Remove a server from the settings file.
    Remove { server: String },
}

/// Prints hub output to the terminal.
struct TerminalObserver {
    print_snapshots: bool,
}

impl HubObserver for TerminalObserver {
    fn publish_server_snapshot(&self, servers: &[McpServer]) {
        if !self.print_snapshots {
            return;
        }
        for server in servers {
            println!(
                "{} {} ({} tools){}",
                server.name,
                server.status,
                server.tools.len(),
                if server.disabled { " [disabled]" } else { "" }
            );
        }
        println!();
    }

    fn show_status(&self, level: StatusLevel, message: &str) {
        match level {
            StatusLevel::Error => eprintln!("error: {message}"),
            StatusLevel::Warning => eprintln!("warning: {message}"),
            StatusLevel::Info => eprintln!("{message}"),
        }
    }
}

async fn start_hub(settings: PathBuf, print_snapshots: bool) -> anyhow::Result<Arc<McpHub>> {
    let hub = McpHub::new(
        SettingsStore::new(settings),
        Arc::new(DefaultTransportFactory),
        Arc::new(TerminalObserver { print_snapshots }),
        HubOptions::default(),
    )?;
    hub.initialize().await?;
    Ok(hub)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn handle_mcp(action: McpAction, settings: PathBuf) -> anyhow::Result<()> {
    let store = SettingsStore::new(&settings);

    match action {
        McpAction::List => {
            let hub = start_hub(settings, false).await?;
            print_json(&hub.sorted_servers().await)?;
            hub.shutdown().await;
        },
        McpAction::Call { server, tool, args } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let hub = start_hub(settings, false).await?;
            let result = hub.call_tool(&server, &tool, arguments).await;
            hub.shutdown().await;
            print_json(&result?)?;
        },
        McpAction::Read { server, uri } => {
            let hub = start_hub(settings, false).await?;
            let result = hub.read_resource(&server, &uri).await;
            hub.shutdown().await;
            print_json(&result?)?;
        },
        McpAction::Watch => {
            let hub = start_hub(settings, true).await?;
            hub.set_notification_consumer(Arc::new(|n: ServerNotification| {
                println!("[{}] {}: {}", n.server_name, n.level, n.message);
            }));
            tokio::signal::ctrl_c().await?;
            hub.clear_notification_consumer();
            let dropped = hub.drain_pending_notifications();
            if !dropped.is_empty() {
                warn!(count = dropped.len(), "discarding undelivered notifications");
            }
            hub.shutdown().await;
        },
        McpAction::Enable { server } => {
            store.set_disabled(&server, false).await?;
            println!("Enabled '{server}'.");
        },
        McpAction::Disable { server } => {
            store.set_disabled(&server, true).await?;
            println!("Disabled '{server}'.");
        },
        McpAction::Approve { server, tools } => {
            store.set_tool_auto_approve(&server, &tools, true).await?;
            println!("Auto-approving {} on '{server}'.", tools.join(", "));
        },
        McpAction::Unapprove { server, tools } => {
            store.set_tool_auto_approve(&server, &tools, false).await?;
            println!("{} on '{server}' now require confirmation.", tools.join(", "));
        },
        McpAction::Timeout { server, seconds } => {
            store.set_timeout(&server, seconds).await?;
            println!("Timeout for '{server}' set to {seconds}s.");
        },
        McpAction::AddRemote {
            name,
            url,
            streamable,
        } => {
            let kind = if streamable {
                TransportKind::StreamableHttp
            } else {
                TransportKind::Sse
            };
            store.ensure_exists().await?;
            store
                .add_server(&name, &McpServerConfig::remote(kind, &url))
                .await?;
            println!("Added '{name}' ({kind}) at {url}.");
        },
        McpAction::Remove { server } => {
            if store.remove_server(&server).await? {
                println!("Removed '{server}'.");
            } else {
                anyhow::bail!("no server named '{server}'");
            }
        },
    }

    Ok(())
}
