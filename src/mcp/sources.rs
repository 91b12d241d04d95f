//! Connection records: the external list of providers the gateway may reach
//!
//! Records are read, never written. `http` and `stdio` records become direct
//! clients; `proxy` records only advertise that `proxy_<id>` can appear once the
//! remote opens its bridge stream.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use super::mcp_client::{McpClient, McpTransport};
use super::registry::{is_proxy_connection, proxy_connection_id, ConnectionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Http,
    Stdio,
    Proxy,
}

/// One provider record
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub connection_type: ConnectionType,
    /// `{url}` for http, `{command, args}` for stdio, free-form for proxy
    #[serde(default)]
    pub connection_config: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_wallet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl ConnectionRecord {
    /// Transport for a direct record; `None` for proxy records
    pub fn transport(&self) -> Result<Option<McpTransport>> {
        match self.connection_type {
            ConnectionType::Proxy => Ok(None),
            ConnectionType::Http => {
                let url = self
                    .connection_config
                    .get("url")
                    .and_then(Value::as_str)
                    .context("http connection requires connectionConfig.url")?;
                McpTransport::parse(url).map(Some)
            }
            ConnectionType::Stdio => {
                let command = self
                    .connection_config
                    .get("command")
                    .and_then(Value::as_str)
                    .filter(|c| !c.trim().is_empty())
                    .context("stdio connection requires connectionConfig.command")?;
                let args = match self.connection_config.get("args") {
                    None | Some(Value::Null) => Vec::new(),
                    Some(v) => serde_json::from_value::<Vec<String>>(v.clone())
                        .context("connectionConfig.args must be an array of strings")?,
                };
                Ok(Some(McpTransport::Stdio {
                    command: command.to_string(),
                    args,
                }))
            }
        }
    }

    /// Id callers use to reach this record through the registry
    pub fn connection_id(&self) -> String {
        match self.connection_type {
            ConnectionType::Proxy => proxy_connection_id(&self.id),
            _ => self.id.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("Connection id cannot be empty");
        }
        if is_proxy_connection(&self.id) {
            anyhow::bail!("Connection id '{}' must not carry the proxy prefix", self.id);
        }
        self.transport()?;
        Ok(())
    }
}

/// Availability row for `GET /connections/available`
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AvailableConnection {
    pub connection_id: String,
    pub config_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub connection_type: ConnectionType,
    pub live: bool,
}

/// Outcome of bringing up direct connections
#[derive(Debug, Default)]
pub struct EstablishReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub proxy_only: Vec<String>,
}

/// The loaded record list
#[derive(Debug, Clone, Default)]
pub struct ConnectionSource {
    records: Vec<ConnectionRecord>,
}

impl ConnectionSource {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read connections file: {}", path.display()))?;
        Self::from_str(&content)
    }

    /// Accepts a bare array or `{"connections": [...]}`
    pub fn from_str(content: &str) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Shape {
            Bare(Vec<ConnectionRecord>),
            Wrapped { connections: Vec<ConnectionRecord> },
        }

        let records = match serde_json::from_str::<Shape>(content).context("Failed to parse connections JSON")? {
            Shape::Bare(r) => r,
            Shape::Wrapped { connections } => connections,
        };

        let source = Self { records };
        source.validate()?;
        Ok(source)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for record in &self.records {
            if !seen.insert(&record.id) {
                anyhow::bail!("Duplicate connection id: {}", record.id);
            }
            record
                .validate()
                .with_context(|| format!("Invalid connection record: {}", record.id))?;
        }
        Ok(())
    }

    pub fn records(&self) -> &[ConnectionRecord] {
        &self.records
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Connect one direct record and register it; proxy records are a no-op
    pub async fn connect(&self, registry: &ConnectionRegistry, record: &ConnectionRecord, timeout: Duration) -> Result<bool> {
        let Some(transport) = record.transport()? else {
            return Ok(false);
        };

        let client = Arc::new(McpClient::with_timeout(transport, timeout));
        client
            .initialize()
            .await
            .with_context(|| format!("Failed to initialize connection '{}'", record.id))?;

        if let Some(previous) = registry.register_direct(record.id.clone(), client) {
            previous.client.close().await;
        }
        Ok(true)
    }

    /// Bring up every direct record concurrently; failures are logged, not fatal
    pub async fn establish(&self, registry: &ConnectionRegistry, timeout: Duration) -> EstablishReport {
        let attempts = self.records.iter().map(|record| async move {
            let outcome = self.connect(registry, record, timeout).await;
            (record, outcome)
        });

        let mut report = EstablishReport::default();
        for (record, outcome) in futures::future::join_all(attempts).await {
            match outcome {
                Ok(true) => report.connected.push(record.id.clone()),
                Ok(false) => report.proxy_only.push(record.id.clone()),
                Err(e) => {
                    tracing::warn!(connection_id = %record.id, error = %format!("{:#}", e), "Connection unavailable");
                    report.failed.push((record.id.clone(), format!("{:#}", e)));
                }
            }
        }

        tracing::info!(
            connected = report.connected.len(),
            failed = report.failed.len(),
            proxy_only = report.proxy_only.len(),
            "Connection records processed"
        );
        report
    }

    pub fn availability(&self, registry: &ConnectionRegistry) -> Vec<AvailableConnection> {
        let active: HashSet<String> = registry.list_active_config_ids().into_iter().collect();
        self.records
            .iter()
            .map(|r| AvailableConnection {
                connection_id: r.connection_id(),
                config_id: r.id.clone(),
                title: r.title.clone(),
                description: r.description.clone(),
                connection_type: r.connection_type,
                live: match r.connection_type {
                    ConnectionType::Proxy => active.contains(&r.id),
                    _ => registry.has_direct(&r.id),
                },
            })
            .collect()
    }
}
