use std::error::Error as StdError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),
    #[error(transparent)]
    Notify(#[from] notify_debouncer_full::notify::Error),
    #[error(transparent)]
    Transport(#[from] McpTransportError),
    #[error(transparent)]
    Manager(#[from] McpManagerError),
    #[error("{message}")]
    Message { message: String },
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external<E>(context: impl Into<String>, source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True when the failure was a request exceeding its deadline.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Transport(McpTransportError::Timeout { .. }))
    }
}

/// Failures raised by a transport or by the peer on the other end of it.
#[derive(Debug, thiserror::Error)]
pub enum McpTransportError {
    #[error("failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("transport is not started")]
    NotStarted,
    #[error("transport closed")]
    Closed,
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u128 },
    #[error("HTTP {status} for '{method}': {body}")]
    Http {
        method: String,
        status: u16,
        body: String,
    },
    #[error("MCP error on '{method}': code={code} message={message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },
    #[error("server sent no endpoint event")]
    MissingEndpoint,
}

/// Failures raised by the hub itself when resolving a server.
#[derive(Debug, thiserror::Error)]
pub enum McpManagerError {
    #[error("no connection found for server: {server}")]
    ServerNotFound { server: String },
    #[error("server \"{server}\" is disabled and cannot be used")]
    ServerDisabled { server: String },
    #[error("server \"{server}\" is not connected")]
    NotConnected { server: String },
    #[error("server \"{server}\" already exists")]
    AlreadyExists { server: String },
    #[error("invalid MCP settings: {reason}")]
    InvalidConfig { reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// `.context()` / `.with_context()` on `Result` and `Option`, producing
/// [`Error::Message`].
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        let ctx = context.into();
        self.map_err(|source| Error::message(format!("{ctx}: {source}")))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|source| {
            let ctx = f().into();
            Error::message(format!("{ctx}: {source}"))
        })
    }
}

impl<T> Context<T> for Option<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| Error::message(context.into()))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.ok_or_else(|| Error::message(f().into()))
    }
}
