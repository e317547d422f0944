#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Scripted fakes for client and hub tests.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    serde_json::{Value, json},
    tokio::sync::Notify,
};

use crate::{
    config::McpServerConfig,
    connection::McpServer,
    error::{Error, McpTransportError, Result},
    notifications::ServerNotification,
    observer::{HubObserver, StatusLevel},
    traits::{McpTransport, TransportEventSender, TransportFactory},
    types::{JsonRpcResponse, PROTOCOL_VERSION},
};

/// How a fake transport answers.
#[derive(Debug, Clone, Default)]
pub(crate) struct FakeBehavior {
    results: HashMap<String, Value>,
    failing: HashSet<String>,
    fail_start: bool,
    fail_close: bool,
    held: Option<(String, Arc<Notify>)>,
}

impl FakeBehavior {
    pub(crate) fn with_result(mut self, method: &str, result: Value) -> Self {
        self.results.insert(method.into(), result);
        self
    }

    /// Requests for `method` fail with a JSON-RPC error.
    pub(crate) fn failing(mut self, method: &str) -> Self {
        self.failing.insert(method.into());
        self
    }

    /// Requests for `method` wait until `gate` is notified.
    pub(crate) fn held(mut self, method: &str, gate: Arc<Notify>) -> Self {
        self.held = Some((method.into(), gate));
        self
    }

    pub(crate) fn fail_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub(crate) fn fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    fn result_for(&self, method: &str) -> Value {
        if let Some(result) = self.results.get(method) {
            return result.clone();
        }
        match method {
            "initialize" => json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "serverInfo": {"name": "fake", "version": "1.0.0"},
            }),
            "tools/list" => json!({"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]}),
            "resources/list" => json!({"resources": [{"uri": "mem://notes", "name": "notes"}]}),
            "resources/templates/list" => {
                json!({"resourceTemplates": [{"uriTemplate": "mem://{id}", "name": "by-id"}]})
            },
            "tools/call" => json!({"content": [{"type": "text", "text": "ok"}]}),
            "resources/read" => json!({"contents": [{"uri": "mem://notes", "text": "hello"}]}),
            _ => json!({}),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub method: String,
    pub params: Option<Value>,
    pub timeout: Duration,
}

/// Transport answering from a [`FakeBehavior`] and recording what it saw.
pub(crate) struct FakeTransport {
    behavior: FakeBehavior,
    calls: Mutex<Vec<RecordedCall>>,
    notifications: Mutex<Vec<String>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl FakeTransport {
    pub(crate) fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method).collect()
    }

    pub(crate) fn last_call(&self) -> Option<RecordedCall> {
        self.calls.lock().unwrap().last().cloned()
    }

    pub(crate) fn notifications(&self) -> Vec<String> {
        self.notifications.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl McpTransport for FakeTransport {
    async fn start(&self) -> Result<()> {
        if self.behavior.fail_start {
            return Err(Error::message("fake start failure"));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: method.into(),
            params,
            timeout,
        });
        if let Some((held, gate)) = &self.behavior.held
            && held == method
        {
            gate.notified().await;
        }
        if self.closed() {
            return Err(McpTransportError::Closed.into());
        }
        if self.behavior.failing.contains(method) {
            return Err(McpTransportError::Rpc {
                method: method.into(),
                code: -32601,
                message: "Method not found".into(),
            }
            .into());
        }
        Ok(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: json!(1),
            result: Some(self.behavior.result_for(method)),
            error: None,
        })
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<()> {
        self.notifications.lock().unwrap().push(method.into());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        if self.behavior.fail_close {
            return Err(Error::message("fake close failure"));
        }
        Ok(())
    }
}

struct Created {
    name: String,
    transport: Arc<FakeTransport>,
    events: TransportEventSender,
}

/// Factory handing out [`FakeTransport`]s, scripted per server name.
#[derive(Default)]
pub(crate) struct FakeFactory {
    behaviors: Mutex<HashMap<String, FakeBehavior>>,
    rejected: Mutex<HashSet<String>>,
    created: Mutex<Vec<Created>>,
}

impl FakeFactory {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn script(&self, name: &str, behavior: FakeBehavior) {
        self.behaviors.lock().unwrap().insert(name.into(), behavior);
    }

    /// `create` fails for `name`.
    pub(crate) fn reject(&self, name: &str) {
        self.rejected.lock().unwrap().insert(name.into());
    }

    pub(crate) fn created_count(&self, name: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name == name)
            .count()
    }

    pub(crate) fn total_created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Most recent transport built for `name`.
    pub(crate) fn transport(&self, name: &str) -> Arc<FakeTransport> {
        let created = self.created.lock().unwrap();
        let last = created.iter().rev().find(|c| c.name == name).unwrap();
        Arc::clone(&last.transport)
    }

    /// Event sender handed to the most recent transport for `name`.
    pub(crate) fn events(&self, name: &str) -> TransportEventSender {
        let created = self.created.lock().unwrap();
        created
            .iter()
            .rev()
            .find(|c| c.name == name)
            .unwrap()
            .events
            .clone()
    }
}

impl TransportFactory for FakeFactory {
    fn create(
        &self,
        server_name: &str,
        _config: &McpServerConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn McpTransport>> {
        if self.rejected.lock().unwrap().contains(server_name) {
            return Err(Error::message(format!("cannot build transport for {server_name}")));
        }
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(server_name)
            .cloned()
            .unwrap_or_default();
        let transport = Arc::new(FakeTransport::new(behavior));
        self.created.lock().unwrap().push(Created {
            name: server_name.into(),
            transport: Arc::clone(&transport),
            events,
        });
        Ok(transport)
    }
}

/// Observer remembering everything the hub told it.
#[derive(Default)]
pub(crate) struct RecordingObserver {
    snapshots: Mutex<Vec<Vec<McpServer>>>,
    statuses: Mutex<Vec<(StatusLevel, String)>>,
    forwarded: Mutex<Vec<ServerNotification>>,
    fail_forward: AtomicBool,
}

impl RecordingObserver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn fail_forwarding(&self) {
        self.fail_forward.store(true, Ordering::SeqCst);
    }

    pub(crate) fn snapshot_count(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub(crate) fn last_snapshot(&self) -> Vec<McpServer> {
        self.snapshots.lock().unwrap().last().cloned().unwrap_or_default()
    }

    pub(crate) fn statuses(&self) -> Vec<(StatusLevel, String)> {
        self.statuses.lock().unwrap().clone()
    }

    pub(crate) fn forwarded(&self) -> Vec<ServerNotification> {
        self.forwarded.lock().unwrap().clone()
    }
}

impl HubObserver for RecordingObserver {
    fn publish_server_snapshot(&self, servers: &[McpServer]) {
        self.snapshots.lock().unwrap().push(servers.to_vec());
    }

    fn show_status(&self, level: StatusLevel, message: &str) {
        self.statuses.lock().unwrap().push((level, message.into()));
    }

    fn forward_notification(&self, notification: &ServerNotification) -> Result<()> {
        self.forwarded.lock().unwrap().push(notification.clone());
        if self.fail_forward.load(Ordering::SeqCst) {
            return Err(Error::message("webview gone"));
        }
        Ok(())
    }
}
