//! Stdio transport: spawn a child process and speak JSON-RPC over its
//! stdin/stdout. Standard error is a separate diagnostic line stream.

use std::{collections::BTreeMap, path::PathBuf, process::Stdio, time::Duration};

use {
    tokio::{
        io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
        process::{Child, ChildStdin, Command},
        sync::Mutex,
        task::JoinHandle,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace, warn},
};

use crate::{
    error::{McpTransportError, Result},
    rpc::{PendingRequests, dispatch_incoming},
    traits::{McpTransport, TransportEvent, TransportEventSender},
    types::JsonRpcNotification,
};

/// Parameters for spawning a stdio server.
#[derive(Debug, Clone)]
pub struct StdioParams {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overlaid on top of the parent's environment.
    pub env: BTreeMap<String, String>,
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    readers: Vec<JoinHandle<()>>,
}

/// Stdio-based transport for an MCP server process.
pub struct StdioTransport {
    params: StdioParams,
    events: TransportEventSender,
    pending: std::sync::Arc<PendingRequests>,
    running: Mutex<Option<Running>>,
    cancel: CancellationToken,
}

impl StdioTransport {
    pub fn new(params: StdioParams, events: TransportEventSender) -> Self {
        Self {
            params,
            events,
            pending: std::sync::Arc::new(PendingRequests::new()),
            running: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn write_line(&self, payload: &str) -> Result<()> {
        let mut running = self.running.lock().await;
        let running = running.as_mut().ok_or(McpTransportError::NotStarted)?;
        running.stdin.write_all(payload.as_bytes()).await?;
        running.stdin.write_all(b"\n").await?;
        running.stdin.flush().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl McpTransport for StdioTransport {
    async fn start(&self) -> Result<()> {
        let StdioParams {
            command,
            args,
            cwd,
            env,
        } = &self.params;
        info!(command = %command, args = ?args, "spawning MCP server process");

        let mut cmd = Command::new(command);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|source| McpTransportError::Spawn {
            command: command.clone(),
            source,
        })?;

        let stdin = child.stdin.take().ok_or(McpTransportError::Closed)?;
        let stdout = child.stdout.take().ok_or(McpTransportError::Closed)?;
        let stderr = child.stderr.take();

        let mut readers = Vec::with_capacity(2);

        if let Some(stderr) = stderr {
            let events = self.events.clone();
            readers.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            let trimmed = line.trim();
                            if !trimmed.is_empty() {
                                let _ = events.send(TransportEvent::Stderr(trimmed.to_string()));
                            }
                        },
                        Ok(None) | Err(_) => break,
                    }
                }
            }));
        }

        let pending = std::sync::Arc::clone(&self.pending);
        let events = self.events.clone();
        readers.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        trace!(raw = %trimmed, "MCP server -> client");
                        dispatch_incoming(trimmed, &pending, &events).await;
                    },
                    Ok(None) => {
                        debug!("MCP server stdout closed");
                        break;
                    },
                    Err(e) => {
                        warn!(error = %e, "error reading from MCP server stdout");
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break;
                    },
                }
            }
            pending.fail_all().await;
            let _ = events.send(TransportEvent::Closed);
        }));

        *self.running.lock().await = Some(Running {
            child,
            stdin,
            readers,
        });
        Ok(())
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<crate::types::JsonRpcResponse> {
        if self.cancel.is_cancelled() {
            return Err(McpTransportError::Closed.into());
        }
        let (req, rx) = self.pending.register(method, params).await;
        debug!(method = %method, id = %req.id, "client -> MCP server");

        let payload = serde_json::to_string(&req)?;
        if let Err(e) = self.write_line(&payload).await {
            self.pending.forget(&req.id_key()).await;
            return Err(e);
        }

        self.pending.wait(&req, rx, timeout, &self.cancel).await
    }

    async fn notify(&self, method: &str, params: Option<serde_json::Value>) -> Result<()> {
        let notif = JsonRpcNotification::new(method, params);
        trace!(method = %method, "client -> MCP server (notification)");
        self.write_line(&serde_json::to_string(&notif)?).await
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        let running = self.running.lock().await.take();
        self.pending.fail_all().await;

        let Some(mut running) = running else {
            return Ok(());
        };
        for handle in running.readers.drain(..) {
            handle.abort();
        }
        drop(running.stdin);
        running.child.kill().await?;
        Ok(())
    }
}
