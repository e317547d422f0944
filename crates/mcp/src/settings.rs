//! Settings gateway: reads, validates and rewrites the `mcpServers` file.
//!
//! Writers edit the raw JSON document rather than re-serializing typed
//! configs, so keys this crate does not know about survive every write and
//! the entry order (which is the display order) never changes.

use std::path::{Path, PathBuf};

use {
    serde_json::{Map, Value},
    tracing::{debug, info, warn},
};

use crate::{
    config::{MIN_TIMEOUT_SECS, McpServerConfig},
    error::{Context, McpManagerError, Result},
};

const SERVERS_KEY: &str = "mcpServers";

/// Validated contents of the settings file, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct McpSettings {
    servers: Vec<(String, McpServerConfig)>,
}

impl McpSettings {
    pub fn from_servers(servers: Vec<(String, McpServerConfig)>) -> Self {
        Self { servers }
    }

    /// Parse and validate a whole settings document.
    pub fn parse(raw: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        Self::from_document(&doc)
    }

    fn from_document(doc: &Value) -> Result<Self> {
        let servers = doc
            .get(SERVERS_KEY)
            .and_then(Value::as_object)
            .ok_or_else(|| invalid(format!("missing \"{SERVERS_KEY}\" object")))?;

        let mut parsed = Vec::with_capacity(servers.len());
        for (name, entry) in servers {
            let config: McpServerConfig = serde_json::from_value(entry.clone())
                .map_err(|e| invalid(format!("server \"{name}\": {e}")))?;
            parsed.push((name.clone(), config));
        }
        Ok(Self { servers: parsed })
    }

    pub fn get(&self, name: &str) -> Option<&McpServerConfig> {
        self.servers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, cfg)| cfg)
    }

    /// Server names in file order.
    pub fn names(&self) -> Vec<String> {
        self.servers.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &McpServerConfig)> {
        self.servers.iter().map(|(n, cfg)| (n.as_str(), cfg))
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

fn invalid(reason: impl Into<String>) -> crate::Error {
    McpManagerError::InvalidConfig {
        reason: reason.into(),
    }
    .into()
}

/// File-backed settings store. The only writer of server definitions.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file with an empty server mapping if it does not exist.
    pub async fn ensure_exists(&self) -> Result<()> {
        if tokio::fs::try_exists(&self.path).await? {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut doc = Map::new();
        doc.insert(SERVERS_KEY.into(), Value::Object(Map::new()));
        self.write_document(&Value::Object(doc)).await?;
        info!(path = %self.path.display(), "created MCP settings file");
        Ok(())
    }

    /// Read and validate, returning the error to the caller.
    pub async fn load(&self) -> Result<McpSettings> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read MCP settings: {}", self.path.display()))?;
        McpSettings::parse(&raw)
    }

    /// Read and validate. An unreadable or invalid file is logged and
    /// reported as "no config".
    pub async fn read(&self) -> Option<McpSettings> {
        match self.load().await {
            Ok(settings) => Some(settings),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "invalid MCP settings");
                None
            },
        }
    }

    /// Server names in file order, or empty when the file is unusable.
    pub async fn server_order(&self) -> Vec<String> {
        self.read().await.map(|s| s.names()).unwrap_or_default()
    }

    /// Tool-call timeout for a server, from the live file.
    pub async fn server_timeout(&self, name: &str) -> Result<u64> {
        let settings = self.load().await?;
        settings
            .get(name)
            .map(|cfg| cfg.timeout)
            .ok_or_else(|| invalid(format!("server \"{name}\" not found in settings")))
    }

    pub async fn set_disabled(&self, name: &str, disabled: bool) -> Result<()> {
        self.update_entry(name, |entry| {
            entry.insert("disabled".into(), Value::Bool(disabled));
            Ok(())
        })
        .await
    }

    /// Add (`approve = true`) or remove tools from a server's auto-approve
    /// list. Repeating the same call leaves the file unchanged.
    pub async fn set_tool_auto_approve(
        &self,
        name: &str,
        tools: &[String],
        approve: bool,
    ) -> Result<()> {
        self.update_entry(name, |entry| {
            let mut list: Vec<String> = entry
                .get("autoApprove")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default();

            for tool in tools {
                if approve {
                    if !list.contains(tool) {
                        list.push(tool.clone());
                    }
                } else {
                    list.retain(|t| t != tool);
                }
            }

            entry.insert(
                "autoApprove".into(),
                Value::Array(list.into_iter().map(Value::String).collect()),
            );
            Ok(())
        })
        .await
    }

    pub async fn set_timeout(&self, name: &str, timeout_secs: u64) -> Result<()> {
        if timeout_secs < MIN_TIMEOUT_SECS {
            return Err(invalid(format!(
                "timeout must be at least {MIN_TIMEOUT_SECS} second(s), got {timeout_secs}"
            )));
        }
        self.update_entry(name, |entry| {
            entry.insert("timeout".into(), Value::from(timeout_secs));
            Ok(())
        })
        .await
    }

    /// Append a new server entry. Fails if the name is already taken.
    pub async fn add_server(&self, name: &str, config: &McpServerConfig) -> Result<()> {
        let mut doc = self.read_document().await?;
        let servers = servers_mut(&mut doc)?;
        if servers.contains_key(name) {
            return Err(McpManagerError::AlreadyExists {
                server: name.to_string(),
            }
            .into());
        }
        servers.insert(name.to_string(), serde_json::to_value(config)?);
        self.validate_and_write(&doc).await?;
        info!(server = %name, kind = %config.kind(), "added MCP server to settings");
        Ok(())
    }

    /// Remove a server entry. Returns whether it existed.
    pub async fn remove_server(&self, name: &str) -> Result<bool> {
        let mut doc = self.read_document().await?;
        let removed = servers_mut(&mut doc)?.shift_remove(name).is_some();
        if removed {
            self.validate_and_write(&doc).await?;
            info!(server = %name, "removed MCP server from settings");
        }
        Ok(removed)
    }

    async fn update_entry<F>(&self, name: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<()>,
    {
        let mut doc = self.read_document().await?;
        let entry = servers_mut(&mut doc)?
            .get_mut(name)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| McpManagerError::ServerNotFound {
                server: name.to_string(),
            })?;
        edit(entry)?;
        self.validate_and_write(&doc).await?;
        debug!(server = %name, "updated MCP server settings");
        Ok(())
    }

    async fn read_document(&self) -> Result<Value> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("failed to read MCP settings: {}", self.path.display()))?;
        serde_json::from_str(&raw).map_err(|e| invalid(e.to_string()))
    }

    async fn validate_and_write(&self, doc: &Value) -> Result<()> {
        McpSettings::from_document(doc)?;
        self.write_document(doc).await
    }

    async fn write_document(&self, doc: &Value) -> Result<()> {
        let data = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&self.path, data).await?;
        Ok(())
    }
}

fn servers_mut(doc: &mut Value) -> Result<&mut Map<String, Value>> {
    doc.get_mut(SERVERS_KEY)
        .and_then(Value::as_object_mut)
        .ok_or_else(|| invalid(format!("missing \"{SERVERS_KEY}\" object")))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{Error, config::TransportKind},
        serde_json::json,
    };

    async fn store_with(doc: Value) -> (tempfile::TempDir, SettingsStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp_settings.json");
        tokio::fs::write(&path, serde_json::to_string_pretty(&doc).unwrap())
            .await
            .unwrap();
        (dir, SettingsStore::new(path))
    }

    #[tokio::test]
    async fn test_ensure_exists_creates_empty_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::new(dir.path().join("nested").join("mcp.json"));
        store.ensure_exists().await.unwrap();

        let settings = store.load().await.unwrap();
        assert!(settings.is_empty());

        // Existing files are left alone.
        store
            .add_server("a", &McpServerConfig::stdio("node", vec![]))
            .await
            .unwrap();
        store.ensure_exists().await.unwrap();
        assert_eq!(store.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_read_invalid_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        let store = SettingsStore::new(path);
        assert!(store.read().await.is_none());
        assert!(matches!(
            store.load().await,
            Err(Error::Manager(McpManagerError::InvalidConfig { .. }))
        ));
    }

    #[tokio::test]
    async fn test_timeout_below_minimum_is_descriptive() {
        let (_dir, store) = store_with(json!({
            "mcpServers": {"a": {"command": "node", "timeout": 0}}
        }))
        .await;
        let err = store.load().await.unwrap_err();
        assert!(err.to_string().contains("server \"a\""));
        assert!(err.to_string().contains("at least 1"));
    }

    #[tokio::test]
    async fn test_order_follows_file() {
        let (_dir, store) = store_with(json!({
            "mcpServers": {
                "zeta": {"command": "z"},
                "alpha": {"command": "a"},
                "mid": {"url": "http://localhost:1/sse"}
            }
        }))
        .await;
        assert_eq!(store.server_order().await, vec!["zeta", "alpha", "mid"]);
    }

    #[tokio::test]
    async fn test_writes_preserve_unrelated_keys() {
        let (_dir, store) = store_with(json!({
            "theme": "dark",
            "mcpServers": {
                "a": {"command": "node", "note": "keep me"},
                "b": {"command": "python"}
            }
        }))
        .await;

        store.set_disabled("a", true).await.unwrap();
        store.set_timeout("a", 120).await.unwrap();

        let doc = store.read_document().await.unwrap();
        assert_eq!(doc["theme"], "dark");
        assert_eq!(doc["mcpServers"]["a"]["note"], "keep me");
        assert_eq!(doc["mcpServers"]["a"]["disabled"], true);
        assert_eq!(doc["mcpServers"]["a"]["timeout"], 120);
        assert_eq!(store.server_order().await, vec!["a", "b"]);
        assert_eq!(store.server_timeout("a").await.unwrap(), 120);
    }

    #[tokio::test]
    async fn test_auto_approve_round_trip_is_idempotent() {
        let (_dir, store) = store_with(json!({
            "mcpServers": {"a": {"command": "node", "autoApprove": ["read"]}}
        }))
        .await;

        let tools = vec!["write".to_string(), "list".to_string()];
        store.set_tool_auto_approve("a", &tools, true).await.unwrap();
        store.set_tool_auto_approve("a", &tools, true).await.unwrap();
        store
            .set_tool_auto_approve("a", &["read".to_string()], false)
            .await
            .unwrap();
        store
            .set_tool_auto_approve("a", &["read".to_string()], false)
            .await
            .unwrap();

        let settings = store.load().await.unwrap();
        let mut approved = settings.get("a").unwrap().auto_approve.clone();
        approved.sort();
        assert_eq!(approved, vec!["list", "write"]);
    }

    #[tokio::test]
    async fn test_set_timeout_rejects_below_minimum() {
        let (_dir, store) = store_with(json!({"mcpServers": {"a": {"command": "n"}}})).await;
        assert!(store.set_timeout("a", 0).await.is_err());
        assert_eq!(store.server_timeout("a").await.unwrap(), 60);
    }

    #[tokio::test]
    async fn test_update_unknown_server_fails() {
        let (_dir, store) = store_with(json!({"mcpServers": {}})).await;
        let err = store.set_disabled("ghost", true).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Manager(McpManagerError::ServerNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_and_remove_server() {
        let (_dir, store) = store_with(json!({"mcpServers": {"a": {"command": "n"}}})).await;
        let remote = McpServerConfig::remote(TransportKind::StreamableHttp, "https://x.dev/mcp");
        store.add_server("remote", &remote).await.unwrap();
        assert!(store.add_server("remote", &remote).await.is_err());

        let settings = store.load().await.unwrap();
        assert_eq!(settings.names(), vec!["a", "remote"]);
        assert_eq!(settings.get("remote"), Some(&remote));

        assert!(store.remove_server("a").await.unwrap());
        assert!(!store.remove_server("a").await.unwrap());
        assert_eq!(store.server_order().await, vec!["remote"]);
    }
}
