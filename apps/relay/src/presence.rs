//! Presence tracking
//!
//! Liveness metadata lives in a TTL key/value store, one key per field and tunnel
//! identifier (`client:{field}:{id}`). Every field expires on its own; a missing field
//! simply reads as unknown. Store failures are logged and never fail a connection or
//! a proxied request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_dynamodb::Client as DynamoDbClient;
use aws_sdk_dynamodb::types::AttributeValue;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use webvpn_common::constants::{ONLINE_TTL_SECS, STATUS_TTL_SECS};
use webvpn_common::{PresenceRecord, current_timestamp_secs, now_rfc3339};

use crate::registry::ConnectionInfo;

/// Key/value store with per-key expiry
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Presence fields, each stored under its own key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceField {
    Online,
    LastSeen,
    Ip,
    Version,
    LastAccess,
}

impl PresenceField {
    fn name(self) -> &'static str {
        match self {
            PresenceField::Online => "online",
            PresenceField::LastSeen => "lastSeen",
            PresenceField::Ip => "ip",
            PresenceField::Version => "version",
            PresenceField::LastAccess => "lastAccess",
        }
    }

    pub fn key(self, tunnel_id: &str) -> String {
        format!("client:{}:{}", self.name(), tunnel_id)
    }
}

/// Process-local store. Expired entries are dropped lazily on read.
#[derive(Default)]
pub struct MemoryPresenceStore {
    entries: DashMap<String, (String, Instant)>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        self.entries
            .remove_if(key, |_, (_, expires)| *expires <= now);
        Ok(None)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

/// DynamoDB table keyed by `key` with a numeric `ttl` attribute (table TTL enabled).
/// DynamoDB deletes expired items lazily, so reads filter on `ttl` as well.
pub struct DynamoPresenceStore {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoPresenceStore {
    pub fn new(client: DynamoDbClient, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

#[async_trait]
impl PresenceStore for DynamoPresenceStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = current_timestamp_secs() + ttl.as_secs() as i64;

        self.client
            .put_item()
            .table_name(&self.table_name)
            .item("key", AttributeValue::S(key.to_string()))
            .item("value", AttributeValue::S(value.to_string()))
            .item("ttl", AttributeValue::N(expires_at.to_string()))
            .send()
            .await
            .context("Failed to write presence item to DynamoDB")?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("key", AttributeValue::S(key.to_string()))
            .send()
            .await
            .context("Failed to read presence item from DynamoDB")?;

        let Some(item) = result.item else {
            return Ok(None);
        };

        let expired = item
            .get("ttl")
            .and_then(|v| v.as_n().ok())
            .and_then(|n| n.parse::<i64>().ok())
            .is_some_and(|ttl| ttl <= current_timestamp_secs());
        if expired {
            return Ok(None);
        }

        Ok(item
            .get("value")
            .and_then(|v| v.as_s().ok())
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key("key", AttributeValue::S(key.to_string()))
            .send()
            .await
            .context("Failed to delete presence item from DynamoDB")?;

        Ok(())
    }
}

/// Writes and reads presence records on top of a [`PresenceStore`]
#[derive(Clone)]
pub struct PresenceTracker {
    store: Arc<dyn PresenceStore>,
    online_ttl: Duration,
    status_ttl: Duration,
}

impl PresenceTracker {
    pub fn new(store: Arc<dyn PresenceStore>) -> Self {
        Self {
            store,
            online_ttl: Duration::from_secs(ONLINE_TTL_SECS),
            status_ttl: Duration::from_secs(STATUS_TTL_SECS),
        }
    }

    async fn put(&self, field: PresenceField, tunnel_id: &str, value: &str, ttl: Duration) {
        if let Err(e) = self.store.set(&field.key(tunnel_id), value, ttl).await {
            warn!(tunnel_id = %tunnel_id, field = field.name(), "Presence write failed: {:#}", e);
        }
    }

    /// Record a fresh connection: online flag plus last-seen, ip and version
    pub async fn mark_online(&self, info: &ConnectionInfo) {
        self.touch(info).await;
    }

    /// Refresh presence after agent traffic, last-seen time included
    pub async fn touch(&self, info: &ConnectionInfo) {
        self.refresh_online(info).await;
        self.put(PresenceField::LastSeen, &info.tunnel_id, &now_rfc3339(), self.status_ttl)
            .await;
    }

    /// Refresh the online window and the connection's ip and version.
    /// The latter are rewritten so a long-lived connection never outlives them.
    pub async fn refresh_online(&self, info: &ConnectionInfo) {
        self.put(PresenceField::Online, &info.tunnel_id, "1", self.online_ttl)
            .await;
        if let Some(ip) = &info.remote_ip {
            self.put(PresenceField::Ip, &info.tunnel_id, ip, self.status_ttl)
                .await;
        }
        if let Some(version) = &info.version {
            self.put(PresenceField::Version, &info.tunnel_id, version, self.status_ttl)
                .await;
        }
    }

    /// Clear the online flag; the remaining fields expire on their own
    pub async fn mark_offline(&self, tunnel_id: &str) {
        if let Err(e) = self.store.delete(&PresenceField::Online.key(tunnel_id)).await {
            warn!(tunnel_id = %tunnel_id, "Presence delete failed: {:#}", e);
        }
        debug!(tunnel_id = %tunnel_id, "Marked offline");
    }

    pub async fn record_access(&self, tunnel_id: &str) {
        self.put(PresenceField::LastAccess, tunnel_id, &now_rfc3339(), self.status_ttl)
            .await;
    }

    async fn read(&self, field: PresenceField, tunnel_id: &str) -> Option<String> {
        match self.store.get(&field.key(tunnel_id)).await {
            Ok(value) => value,
            Err(e) => {
                warn!(tunnel_id = %tunnel_id, field = field.name(), "Presence read failed: {:#}", e);
                None
            }
        }
    }

    pub async fn record(&self, tunnel_id: &str) -> PresenceRecord {
        PresenceRecord {
            id: tunnel_id.to_string(),
            online: self.read(PresenceField::Online, tunnel_id).await.is_some(),
            last_seen: self.read(PresenceField::LastSeen, tunnel_id).await,
            ip: self.read(PresenceField::Ip, tunnel_id).await,
            version: self.read(PresenceField::Version, tunnel_id).await,
            last_access: self.read(PresenceField::LastAccess, tunnel_id).await,
        }
    }

    /// Presence records for `tunnel_ids`, in the same order
    pub async fn snapshot(&self, tunnel_ids: &[String]) -> Vec<PresenceRecord> {
        futures_util::future::join_all(tunnel_ids.iter().map(|id| self.record(id))).await
    }
}
