//! McpHub: the supervised registry of MCP server connections.
//!
//! The hub converges the live registry onto the settings file, keeps per
//! connection status current from transport events, restarts stdio servers
//! whose build output changes and routes server notifications to a single
//! consumer. Callers only ever see [`McpServer`] snapshots.

use std::{
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    regex::Regex,
    tokio::{
        sync::{Mutex as AsyncMutex, RwLock, mpsc},
        task::JoinHandle,
    },
    tracing::{debug, error, info, warn},
};

use crate::{
    client::McpClient,
    config::{DEFAULT_TIMEOUT_SECS, McpServerConfig, TransportKind},
    connection::{Connection, ConnectionStatus, McpServer},
    error::{Error, McpManagerError, Result},
    notifications::{NotificationConsumer, NotificationRouter, ServerNotification},
    observer::{HubObserver, StatusLevel},
    settings::{McpSettings, SettingsStore},
    traits::{TransportEvent, TransportEventReceiver, TransportEventSender, TransportFactory},
    types::{
        JsonRpcNotification, McpResource, McpResourceTemplate, McpToolDef, ResourceReadResult,
        ToolsCallResult,
    },
    watcher::{FileWatcher, WatchEvent, build_artifact},
};

/// Tunables for [`McpHub`].
#[derive(Debug, Clone)]
pub struct HubOptions {
    /// Tool-call timeout used when the settings file cannot supply one.
    pub default_tool_timeout: Duration,
    /// Timeout for handshake, discovery and resource reads.
    pub request_timeout: Duration,
    /// Pause before a restarted server is reconnected.
    pub restart_delay: Duration,
    /// Notifications kept while no consumer is registered.
    pub pending_capacity: usize,
    pub watch_debounce: Duration,
    /// Stderr lines matching this are informational rather than errors.
    pub stderr_info_pattern: String,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            default_tool_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(60),
            restart_delay: Duration::from_millis(500),
            pending_capacity: 100,
            watch_debounce: Duration::from_millis(500),
            stderr_info_pattern: "(?i)INFO".into(),
        }
    }
}

/// Mutable state behind the single `RwLock` on [`McpHub`].
#[derive(Default)]
struct HubInner {
    /// Registry order: creation order, not display order.
    connections: Vec<Connection>,
}

impl HubInner {
    fn find(&self, name: &str) -> Option<&Connection> {
        self.connections.iter().find(|c| c.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Connection> {
        self.connections.iter_mut().find(|c| c.name == name)
    }

    fn current(&mut self, name: &str, generation: u64) -> Option<&mut Connection> {
        self.find_mut(name).filter(|c| c.generation == generation)
    }
}

struct Established {
    client: Arc<McpClient>,
    tools: Vec<McpToolDef>,
    resources: Vec<McpResource>,
    resource_templates: Vec<McpResourceTemplate>,
}

/// Supervises every configured MCP server.
pub struct McpHub {
    store: SettingsStore,
    factory: Arc<dyn TransportFactory>,
    observer: Arc<dyn HubObserver>,
    options: HubOptions,
    info_marker: Regex,
    inner: RwLock<HubInner>,
    /// Held for every structural change to the registry.
    structure: AsyncMutex<()>,
    reconciling: AtomicBool,
    next_generation: AtomicU64,
    router: NotificationRouter,
    artifact_watchers: Mutex<Vec<FileWatcher>>,
    settings_watcher: Mutex<Option<FileWatcher>>,
    watch_tx: mpsc::UnboundedSender<WatchEvent>,
    watch_rx: Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    this: Weak<McpHub>,
}

impl McpHub {
    pub fn new(
        store: SettingsStore,
        factory: Arc<dyn TransportFactory>,
        observer: Arc<dyn HubObserver>,
        options: HubOptions,
    ) -> Result<Arc<Self>> {
        let info_marker = Regex::new(&options.stderr_info_pattern)
            .map_err(|e| Error::external("invalid stderr info pattern", e))?;
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();

        Ok(Arc::new_cyclic(|this| Self {
            store,
            factory,
            observer,
            router: NotificationRouter::new(options.pending_capacity),
            options,
            info_marker,
            inner: RwLock::new(HubInner::default()),
            structure: AsyncMutex::new(()),
            reconciling: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            artifact_watchers: Mutex::new(Vec::new()),
            settings_watcher: Mutex::new(None),
            watch_tx,
            watch_rx: Mutex::new(Some(watch_rx)),
            watch_task: Mutex::new(None),
            this: this.clone(),
        }))
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.store
    }

    /// Create the settings file if needed, start watching it and converge
    /// onto its contents.
    pub async fn initialize(&self) -> Result<()> {
        self.store.ensure_exists().await?;
        self.start_watch_loop();
        self.watch_settings();
        self.reload().await
    }

    /// Re-read the settings file and reconcile against it.
    pub async fn reload(&self) -> Result<()> {
        let settings = self.store.load().await?;
        self.reconcile(&settings).await;
        Ok(())
    }

    /// True while a reconciliation pass is running. Advisory only.
    pub fn is_reconciling(&self) -> bool {
        self.reconciling.load(Ordering::SeqCst)
    }

    // ── Reconciliation ──────────────────────────────────────────────

    /// Converge the registry onto `desired`. Per-server failures are logged
    /// and recorded on the connection; they never abort the pass.
    pub async fn reconcile(&self, desired: &McpSettings) {
        let _structure = self.structure.lock().await;
        self.reconcile_locked(desired).await;
    }

    async fn reconcile_locked(&self, desired: &McpSettings) {
        self.reconciling.store(true, Ordering::SeqCst);

        let current: Vec<(String, serde_json::Value)> = {
            let inner = self.inner.read().await;
            inner
                .connections
                .iter()
                .map(|c| (c.name.clone(), c.snapshot.clone()))
                .collect()
        };

        for (name, _) in &current {
            if desired.get(name).is_none() {
                self.delete_one(name).await;
                info!(server = %name, "removed MCP server");
            }
        }

        self.reset_artifact_watchers(desired);

        for (name, config) in desired.iter() {
            match current.iter().find(|(n, _)| n == name) {
                Some((_, snapshot)) if *snapshot == config.snapshot() => continue,
                Some(_) => info!(server = %name, "MCP server config changed, reconnecting"),
                None => debug!(server = %name, "new MCP server"),
            }
            if let Err(e) = self.connect_to_server(name, config).await {
                error!(server = %name, error = %e, "failed to connect to MCP server");
            }
        }

        self.reconciling.store(false, Ordering::SeqCst);
        self.publish().await;
    }

    /// Replace any entry named `name` with a fresh connection built from
    /// `config`. Caller holds the structure lock.
    async fn connect_to_server(&self, name: &str, config: &McpServerConfig) -> Result<()> {
        self.delete_one(name).await;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let mut conn = Connection::new(name, config.clone(), generation);
        if config.disabled {
            debug!(server = %name, "MCP server is disabled");
            self.inner.write().await.connections.push(conn);
            return Ok(());
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        conn.pump = Some(self.spawn_event_pump(name, generation, events_rx));
        self.inner.write().await.connections.push(conn);

        // Network work happens outside the lock.
        let outcome = self.establish(name, config, events_tx).await;

        let mut inner = self.inner.write().await;
        let Some(conn) = inner.current(name, generation) else {
            return Ok(());
        };

        match outcome {
            Ok(established) => {
                info!(
                    server = %name,
                    tools = established.tools.len(),
                    resources = established.resources.len(),
                    "MCP server connected"
                );
                conn.client = Some(established.client);
                conn.tools = established.tools;
                conn.resources = established.resources;
                conn.resource_templates = established.resource_templates;
                // A close seen during the handshake wins.
                if conn.status == ConnectionStatus::Connecting {
                    conn.status = ConnectionStatus::Connected;
                }
                Ok(())
            },
            Err(e) => {
                conn.status = ConnectionStatus::Disconnected;
                conn.append_error(&e.to_string());
                Err(e)
            },
        }
    }

    async fn establish(
        &self,
        name: &str,
        config: &McpServerConfig,
        events: TransportEventSender,
    ) -> Result<Established> {
        let transport = self.factory.create(name, config, events)?;
        let client =
            Arc::new(McpClient::connect(name, transport, self.options.request_timeout).await?);

        let (tools, resources, resource_templates) = tokio::join!(
            client.list_tools(),
            client.list_resources(),
            client.list_resource_templates(),
        );

        Ok(Established {
            tools: or_empty(name, "tools", tools),
            resources: or_empty(name, "resources", resources),
            resource_templates: or_empty(name, "resource templates", resource_templates),
            client,
        })
    }

    /// Remove `name` from the registry and close whatever it held. Close
    /// failures are logged and swallowed.
    async fn delete_one(&self, name: &str) {
        let removed = {
            let mut inner = self.inner.write().await;
            inner
                .connections
                .iter()
                .position(|c| c.name == name)
                .map(|idx| inner.connections.remove(idx))
        };
        let Some(mut conn) = removed else {
            return;
        };

        if let Some(pump) = conn.pump.take() {
            pump.abort();
        }
        if let Some(client) = conn.client.take()
            && let Err(e) = client.close().await
        {
            warn!(server = %name, error = %e, "failed to close MCP connection");
        }
        debug!(server = %name, "deleted MCP connection");
    }

    /// Reconnect one server with its known config after the restart delay.
    /// Outcomes are reported as status messages, never returned.
    pub async fn restart_connection(&self, name: &str) {
        let _structure = self.structure.lock().await;

        let config = self.inner.read().await.find(name).map(|c| c.config.clone());
        let Some(config) = config else {
            warn!(server = %name, "cannot restart unknown MCP server");
            return;
        };

        info!(server = %name, "restarting MCP server");
        self.observer
            .show_status(StatusLevel::Info, &format!("Restarting {name} MCP server..."));
        tokio::time::sleep(self.options.restart_delay).await;

        match self.connect_to_server(name, &config).await {
            Ok(()) => self
                .observer
                .show_status(StatusLevel::Info, &format!("{name} MCP server connected")),
            Err(e) => {
                error!(server = %name, error = %e, "failed to restart MCP server");
                self.observer.show_status(
                    StatusLevel::Error,
                    &format!("Failed to restart {name} MCP server connection: {e}"),
                );
            },
        }
        self.publish().await;
    }

    /// Close every connection and stop all watchers.
    pub async fn shutdown(&self) {
        *self
            .settings_watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = None;
        self.artifact_watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        let task = self
            .watch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let _structure = self.structure.lock().await;
        let names: Vec<String> = {
            let inner = self.inner.read().await;
            inner.connections.iter().map(|c| c.name.clone()).collect()
        };
        for name in names {
            self.delete_one(&name).await;
        }
        info!("MCP hub shut down");
    }

    // ── Queries ─────────────────────────────────────────────────────

    /// Snapshot in registry order.
    pub async fn get_connections(&self, include_disabled: bool) -> Vec<McpServer> {
        let live = self.store.read().await;
        let inner = self.inner.read().await;
        inner
            .connections
            .iter()
            .filter(|c| include_disabled || !c.disabled)
            .map(|c| c.to_server(live.as_ref().and_then(|s| s.get(&c.name))))
            .collect()
    }

    pub async fn server(&self, name: &str) -> Option<McpServer> {
        let live = self.store.read().await;
        let inner = self.inner.read().await;
        inner
            .find(name)
            .map(|c| c.to_server(live.as_ref().and_then(|s| s.get(name))))
    }

    /// Registry entries arranged by `order`. Names missing from either side
    /// are skipped.
    pub async fn sorted_connections(&self, order: &[String]) -> Vec<McpServer> {
        let live = self.store.read().await;
        let inner = self.inner.read().await;
        arrange(&inner, order, live.as_ref())
    }

    /// Registry entries in settings-file order, re-read now. Falls back to
    /// registry order while the file is unusable.
    pub async fn sorted_servers(&self) -> Vec<McpServer> {
        let live = self.store.read().await;
        let inner = self.inner.read().await;
        match &live {
            Some(settings) => arrange(&inner, &settings.names(), Some(settings)),
            None => inner.connections.iter().map(|c| c.to_server(None)).collect(),
        }
    }

    async fn publish(&self) {
        let servers = self.sorted_servers().await;
        self.observer.publish_server_snapshot(&servers);
    }

    // ── Invocation ──────────────────────────────────────────────────

    async fn client_for(&self, server: &str) -> Result<Arc<McpClient>> {
        let inner = self.inner.read().await;
        let conn = inner
            .find(server)
            .ok_or_else(|| McpManagerError::ServerNotFound {
                server: server.into(),
            })?;
        if conn.disabled {
            return Err(McpManagerError::ServerDisabled {
                server: server.into(),
            }
            .into());
        }
        conn.client.clone().ok_or_else(|| {
            McpManagerError::NotConnected {
                server: server.into(),
            }
            .into()
        })
    }

    /// Call `tool` on `server` with the timeout currently in the settings
    /// file.
    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolsCallResult> {
        let client = self.client_for(server).await?;
        let timeout = match self.store.server_timeout(server).await {
            Ok(secs) => Duration::from_secs(secs),
            Err(e) => {
                warn!(
                    server = %server,
                    error = %e,
                    "could not read tool timeout from settings, using default"
                );
                self.options.default_tool_timeout
            },
        };
        debug!(
            server = %server,
            tool = %tool,
            timeout_secs = timeout.as_secs(),
            "calling MCP tool"
        );
        client.call_tool(tool, arguments, timeout).await
    }

    pub async fn read_resource(&self, server: &str, uri: &str) -> Result<ResourceReadResult> {
        let client = self.client_for(server).await?;
        client.read_resource(uri).await
    }

    // ── Settings mutations ──────────────────────────────────────────

    /// Persist the flag, flip the entry in place, then reconcile.
    pub async fn toggle_server_disabled(&self, name: &str, disabled: bool) -> Result<()> {
        self.store.set_disabled(name, disabled).await?;
        {
            // Waits out any in-flight connect so a client is never attached
            // to an entry that has just been disabled.
            let _structure = self.structure.lock().await;
            if let Some(conn) = self.inner.write().await.find_mut(name) {
                conn.disabled = disabled;
                if disabled {
                    conn.status = ConnectionStatus::Disconnected;
                }
            }
        }
        self.publish().await;
        self.reload().await
    }

    pub async fn toggle_tool_auto_approve(
        &self,
        name: &str,
        tools: &[String],
        approve: bool,
    ) -> Result<()> {
        self.store
            .set_tool_auto_approve(name, tools, approve)
            .await?;
        self.publish().await;
        Ok(())
    }

    pub async fn update_server_timeout(&self, name: &str, timeout_secs: u64) -> Result<()> {
        self.store.set_timeout(name, timeout_secs).await?;
        self.reload().await
    }

    pub async fn add_remote_server(
        &self,
        name: &str,
        url: &str,
        kind: TransportKind,
    ) -> Result<()> {
        if kind == TransportKind::Stdio {
            return Err(McpManagerError::InvalidConfig {
                reason: format!("server \"{name}\": a remote server cannot use stdio"),
            }
            .into());
        }
        url::Url::parse(url)?;
        self.store
            .add_server(name, &McpServerConfig::remote(kind, url))
            .await?;
        info!(server = %name, url = %url, transport = %kind, "added remote MCP server");
        self.reload().await
    }

    pub async fn delete_server(&self, name: &str) -> Result<()> {
        if !self.store.remove_server(name).await? {
            return Err(McpManagerError::ServerNotFound {
                server: name.into(),
            }
            .into());
        }
        self.reload().await
    }

    // ── Notifications ───────────────────────────────────────────────

    /// Register the single active consumer, replacing any previous one.
    pub fn set_notification_consumer(&self, consumer: NotificationConsumer) {
        self.router.set_consumer(consumer);
    }

    pub fn clear_notification_consumer(&self) {
        self.router.clear_consumer();
    }

    /// Take the notifications queued while no consumer was registered.
    pub fn drain_pending_notifications(&self) -> Vec<ServerNotification> {
        self.router.drain()
    }

    fn route_notification(&self, server: &str, notif: &JsonRpcNotification) {
        let notification = ServerNotification::from_jsonrpc(server, notif);
        self.router.route(notification.clone());
        if let Err(e) = self.observer.forward_notification(&notification) {
            warn!(server = %server, error = %e, "failed to forward MCP notification");
        }
    }

    // ── Transport events ────────────────────────────────────────────

    fn spawn_event_pump(
        &self,
        name: &str,
        generation: u64,
        mut events: TransportEventReceiver,
    ) -> JoinHandle<()> {
        let hub = self.this.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                hub.handle_transport_event(&name, generation, event).await;
            }
        })
    }

    async fn handle_transport_event(&self, name: &str, generation: u64, event: TransportEvent) {
        if let TransportEvent::Notification(notif) = &event {
            self.route_notification(name, notif);
            return;
        }

        let publish = {
            let mut inner = self.inner.write().await;
            let Some(conn) = inner.current(name, generation) else {
                debug!(server = %name, "ignoring event from replaced transport");
                return;
            };
            match event {
                TransportEvent::Error(message) => {
                    warn!(server = %name, error = %message, "MCP transport error");
                    conn.status = ConnectionStatus::Disconnected;
                    conn.append_error(&message);
                    true
                },
                TransportEvent::Closed => {
                    info!(server = %name, "MCP transport closed");
                    conn.status = ConnectionStatus::Disconnected;
                    true
                },
                TransportEvent::Stderr(line) if self.info_marker.is_match(&line) => {
                    info!(server = %name, "{line}");
                    false
                },
                TransportEvent::Stderr(line) => {
                    warn!(server = %name, stderr = %line, "MCP server stderr");
                    conn.append_error(&line);
                    conn.status == ConnectionStatus::Disconnected
                },
                TransportEvent::Notification(_) => false,
            }
        };
        if publish {
            self.publish().await;
        }
    }

    // ── Watchers ────────────────────────────────────────────────────

    fn start_watch_loop(&self) {
        let Some(mut rx) = self
            .watch_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let hub = self.this.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(hub) = hub.upgrade() else {
                    break;
                };
                match event {
                    WatchEvent::Restart(name) => hub.restart_connection(&name).await,
                    WatchEvent::SettingsChanged => hub.settings_changed().await,
                }
            }
        });
        *self.watch_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    fn watch_settings(&self) {
        match FileWatcher::start(
            self.store.path(),
            self.options.watch_debounce,
            WatchEvent::SettingsChanged,
            self.watch_tx.clone(),
        ) {
            Ok(watcher) => {
                *self
                    .settings_watcher
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(watcher);
            },
            Err(e) => warn!(
                path = %self.store.path().display(),
                error = %e,
                "failed to watch MCP settings file"
            ),
        }
    }

    async fn settings_changed(&self) {
        match self.store.load().await {
            Ok(settings) => {
                info!("MCP settings changed, reconciling");
                self.reconcile(&settings).await;
            },
            Err(e) => {
                warn!(error = %e, "ignoring invalid MCP settings");
                self.observer
                    .show_status(StatusLevel::Error, &format!("Invalid MCP settings format: {e}"));
            },
        }
    }

    /// Drop every artifact watcher and install one per enabled stdio server.
    fn reset_artifact_watchers(&self, settings: &McpSettings) {
        let mut watchers = self
            .artifact_watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        watchers.clear();

        for (name, config) in settings.iter() {
            if config.disabled {
                continue;
            }
            let Some(artifact) = build_artifact(config) else {
                continue;
            };
            match FileWatcher::start(
                &artifact,
                self.options.watch_debounce,
                WatchEvent::Restart(name.to_string()),
                self.watch_tx.clone(),
            ) {
                Ok(watcher) => watchers.push(watcher),
                Err(e) => warn!(
                    server = %name,
                    path = %artifact.display(),
                    error = %e,
                    "failed to watch MCP server build output"
                ),
            }
        }
    }
}

fn or_empty<T>(server: &str, what: &str, result: Result<Vec<T>>) -> Vec<T> {
    result.unwrap_or_else(|e| {
        warn!(server = %server, error = %e, "failed to list MCP {what}");
        Vec::new()
    })
}

fn arrange(inner: &HubInner, order: &[String], live: Option<&McpSettings>) -> Vec<McpServer> {
    order
        .iter()
        .filter_map(|name| inner.find(name))
        .map(|c| c.to_server(live.and_then(|s| s.get(&c.name))))
        .collect()
}
