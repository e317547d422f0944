//! Declarative server definitions as stored under `mcpServers`.

use std::{collections::BTreeMap, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Tool calls use this timeout when the entry does not set one.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Timeouts below this are rejected at validation.
pub const MIN_TIMEOUT_SECS: u64 = 1;

/// Transport kind tag, as written in the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamableHttp",
        })
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdio" => Ok(Self::Stdio),
            "sse" => Ok(Self::Sse),
            "streamableHttp" | "streamable-http" | "http" => Ok(Self::StreamableHttp),
            other => Err(format!("unknown transport type \"{other}\"")),
        }
    }
}

/// Transport-specific part of a server definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    StreamableHttp {
        url: String,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Sse { .. } => TransportKind::Sse,
            Self::StreamableHttp { .. } => TransportKind::StreamableHttp,
        }
    }
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawServerConfig", rename_all = "camelCase")]
pub struct McpServerConfig {
    #[serde(flatten)]
    pub transport: TransportConfig,
    pub disabled: bool,
    /// Tool call timeout in seconds.
    pub timeout: u64,
    pub auto_approve: Vec<String>,
}

impl McpServerConfig {
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_transport(TransportConfig::Stdio {
            command: command.into(),
            args,
            cwd: None,
            env: BTreeMap::new(),
        })
    }

    pub fn remote(kind: TransportKind, url: impl Into<String>) -> Self {
        let url = url.into();
        let transport = match kind {
            TransportKind::StreamableHttp => TransportConfig::StreamableHttp {
                url,
                headers: BTreeMap::new(),
            },
            TransportKind::Sse | TransportKind::Stdio => TransportConfig::Sse {
                url,
                headers: BTreeMap::new(),
            },
        };
        Self::with_transport(transport)
    }

    fn with_transport(transport: TransportConfig) -> Self {
        Self {
            transport,
            disabled: false,
            timeout: DEFAULT_TIMEOUT_SECS,
            auto_approve: Vec::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub fn is_auto_approved(&self, tool: &str) -> bool {
        self.auto_approve.iter().any(|t| t == tool)
    }

    /// Structural form used to detect drift between the settings file and a
    /// live connection.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Unvalidated shape of an entry; `type` may be omitted and is inferred.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerConfig {
    #[serde(default, rename = "type", alias = "transportType")]
    kind: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    disabled: bool,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    auto_approve: Vec<String>,
}

impl TryFrom<RawServerConfig> for McpServerConfig {
    type Error = String;

    fn try_from(raw: RawServerConfig) -> Result<Self, Self::Error> {
        let kind = match raw.kind.as_deref() {
            Some(k) => k.parse::<TransportKind>()?,
            None if raw.command.is_some() => TransportKind::Stdio,
            None if raw.url.is_some() => TransportKind::Sse,
            None => return Err("server must define either a command or a url".into()),
        };

        let transport = match kind {
            TransportKind::Stdio => {
                let command = raw
                    .command
                    .filter(|c| !c.trim().is_empty())
                    .ok_or("stdio server requires a non-empty command")?;
                TransportConfig::Stdio {
                    command,
                    args: raw.args,
                    cwd: raw.cwd,
                    env: raw.env,
                }
            },
            TransportKind::Sse | TransportKind::StreamableHttp => {
                let url = raw.url.ok_or_else(|| format!("{kind} server requires a url"))?;
                url::Url::parse(&url).map_err(|e| format!("invalid url \"{url}\": {e}"))?;
                if kind == TransportKind::Sse {
                    TransportConfig::Sse {
                        url,
                        headers: raw.headers,
                    }
                } else {
                    TransportConfig::StreamableHttp {
                        url,
                        headers: raw.headers,
                    }
                }
            },
        };

        let timeout = raw.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout < MIN_TIMEOUT_SECS {
            return Err(format!(
                "timeout must be at least {MIN_TIMEOUT_SECS} second(s), got {timeout}"
            ));
        }

        Ok(Self {
            transport,
            disabled: raw.disabled,
            timeout,
            auto_approve: raw.auto_approve,
        })
    }
}
