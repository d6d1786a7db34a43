//! Endpoint lookup, authorization and access logging
//!
//! Endpoint definitions and the access log belong to the administrative layer; the
//! relay only reads the former and appends to the latter through the traits below.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};
use webvpn_common::EndpointConfig;

use crate::auth::{CallerIdentity, PERMISSION_CLIENTS_MANAGE};

/// Whether `caller` may open or observe the tunnel of `endpoint`
pub fn may_view(caller: &CallerIdentity, endpoint: &EndpointConfig) -> bool {
    caller.is_admin() || endpoint.owner_id == caller.user_id
}

/// Whether `caller` may issue or revoke keys for `endpoint`
pub fn may_manage(caller: &CallerIdentity, endpoint: &EndpointConfig) -> bool {
    caller.has_permission(PERMISSION_CLIENTS_MANAGE)
        && (caller.is_admin() || endpoint.owner_id == caller.user_id)
}

/// Read access to endpoint definitions
#[async_trait]
pub trait EndpointStore: Send + Sync {
    async fn get(&self, tunnel_id: &str) -> Result<Option<EndpointConfig>>;
    async fn list(&self) -> Result<Vec<EndpointConfig>>;
}

/// Endpoints held in memory, optionally loaded from a JSON array file
#[derive(Debug, Default)]
pub struct MemoryEndpointStore {
    endpoints: HashMap<String, EndpointConfig>,
}

impl MemoryEndpointStore {
    pub fn new(endpoints: impl IntoIterator<Item = EndpointConfig>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|endpoint| (endpoint.id.clone(), endpoint))
                .collect(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read endpoints file {}", path.display()))?;
        let endpoints: Vec<EndpointConfig> = serde_json::from_slice(&bytes)
            .with_context(|| format!("Invalid endpoints file {}", path.display()))?;

        for endpoint in &endpoints {
            if let Err(e) = webvpn_common::validation::validate_tunnel_id(&endpoint.id) {
                warn!("Endpoint {:?} will be unreachable: {}", endpoint.id, e);
            }
        }
        info!("Loaded {} endpoints from {}", endpoints.len(), path.display());
        Ok(Self::new(endpoints))
    }
}

#[async_trait]
impl EndpointStore for MemoryEndpointStore {
    async fn get(&self, tunnel_id: &str) -> Result<Option<EndpointConfig>> {
        Ok(self.endpoints.get(tunnel_id).cloned())
    }

    async fn list(&self) -> Result<Vec<EndpointConfig>> {
        let mut endpoints: Vec<EndpointConfig> = self.endpoints.values().cloned().collect();
        endpoints.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(endpoints)
    }
}

/// One proxied request, as recorded for auditing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub tunnel_id: String,
    pub caller_id: String,
    pub method: String,
    /// Path actually sent upstream
    pub path: String,
    pub status: u16,
    pub ip: String,
    /// RFC 3339
    pub timestamp: String,
}

#[async_trait]
pub trait AccessLogSink: Send + Sync {
    async fn append(&self, entry: AccessLogEntry) -> Result<()>;
}

/// Emits access log entries as structured events on the `access_log` target
#[derive(Debug, Default)]
pub struct TracingAccessLog;

#[async_trait]
impl AccessLogSink for TracingAccessLog {
    async fn append(&self, entry: AccessLogEntry) -> Result<()> {
        info!(
            target: "access_log",
            tunnel_id = %entry.tunnel_id,
            caller_id = %entry.caller_id,
            method = %entry.method,
            path = %entry.path,
            status = entry.status,
            ip = %entry.ip,
            timestamp = %entry.timestamp,
            "proxied request"
        );
        Ok(())
    }
}
