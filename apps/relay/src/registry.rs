//! Connection registry
//!
//! Maps each tunnel identifier to its single live agent connection. Every connection
//! owns the arena of requests dispatched over it, so tearing a connection down can
//! enumerate and fail its outstanding requests deterministically.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::relay::{AgentReply, RelayError};

/// Final outcome of one dispatched request
pub(crate) type Completion = Result<AgentReply, RelayError>;

/// Metadata captured when an agent authenticates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub tunnel_id: String,
    /// Version string reported by the agent, for presence only
    pub version: Option<String>,
    pub remote_ip: Option<String>,
    pub opened_at: DateTime<Utc>,
}

impl ConnectionInfo {
    pub fn new(
        tunnel_id: impl Into<String>,
        version: Option<String>,
        remote_ip: Option<String>,
    ) -> Self {
        Self {
            tunnel_id: tunnel_id.into(),
            version,
            remote_ip,
            opened_at: Utc::now(),
        }
    }
}

/// A text frame queued for the agent socket. Request frames carry their id so a
/// failed socket write can fail exactly that request.
#[derive(Debug)]
pub struct OutboundFrame {
    pub text: String,
    pub request_id: Option<String>,
}

impl OutboundFrame {
    pub fn notice(text: String) -> Self {
        Self {
            text,
            request_id: None,
        }
    }
}

pub(crate) struct PendingRequest {
    pub(crate) resolve: oneshot::Sender<Completion>,
    pub(crate) deadline: Instant,
}

/// One authenticated agent connection
pub struct TunnelConnection {
    connection_id: u64,
    info: ConnectionInfo,
    pub(crate) outbound: mpsc::Sender<OutboundFrame>,
    pub(crate) pending: DashMap<String, PendingRequest>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl TunnelConnection {
    fn new(connection_id: u64, info: ConnectionInfo, outbound: mpsc::Sender<OutboundFrame>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            connection_id,
            info,
            outbound,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Registry-assigned id, distinct for every registration
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn tunnel_id(&self) -> &str {
        &self.info.tunnel_id
    }

    /// Number of requests waiting for a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Flips to `true` once the connection is replaced or unregistered
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Resolve a pending request. Returns false when it was already resolved,
    /// which is how every resolution path guarantees at most one outcome.
    pub(crate) fn settle(&self, request_id: &str, outcome: Completion) -> bool {
        match self.pending.remove(request_id) {
            Some((_, pending)) => {
                // The caller may have gone away; the entry is resolved either way
                let _ = pending.resolve.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail every pending request with `reason` and signal the socket task to stop.
    /// Safe to call more than once.
    pub(crate) fn close(&self, reason: RelayError) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);

        let ids: Vec<String> = self.pending.iter().map(|entry| entry.key().clone()).collect();
        ids.iter()
            .filter(|id| self.settle(id, Err(reason.clone())))
            .count()
    }
}

impl std::fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("connection_id", &self.connection_id)
            .field("tunnel_id", &self.info.tunnel_id)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// In-process map from tunnel identifier to its live connection.
///
/// Entries are sharded per identifier, so registrations for different tunnels never
/// contend and a lookup never sees a half-replaced mapping.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<TunnelConnection>>,
    next_connection_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, replacing any previous one for the same identifier.
    /// Requests pending on the replaced connection fail with `ConnectionReplaced`.
    pub fn register(
        &self,
        info: ConnectionInfo,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> Arc<TunnelConnection> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1;
        let tunnel_id = info.tunnel_id.clone();
        let connection = Arc::new(TunnelConnection::new(connection_id, info, outbound));

        if let Some(previous) = self.connections.insert(tunnel_id.clone(), connection.clone()) {
            let failed = previous.close(RelayError::ConnectionReplaced);
            info!(
                tunnel_id = %tunnel_id,
                previous = previous.connection_id(),
                failed_requests = failed,
                "Replaced existing agent connection"
            );
        }

        debug!(tunnel_id = %tunnel_id, connection_id, "Registered agent connection");
        connection
    }

    /// Remove `connection` if it is still the current one for its identifier, and fail
    /// its pending requests with `ConnectionClosed`. Idempotent; returns whether the
    /// mapping was removed by this call.
    pub fn unregister(&self, connection: &TunnelConnection) -> bool {
        let removed = self
            .connections
            .remove_if(connection.tunnel_id(), |_, current| {
                current.connection_id() == connection.connection_id()
            })
            .is_some();

        let failed = connection.close(RelayError::ConnectionClosed);
        if removed || failed > 0 {
            debug!(
                tunnel_id = %connection.tunnel_id(),
                connection_id = connection.connection_id(),
                failed_requests = failed,
                "Unregistered agent connection"
            );
        }
        removed
    }

    pub fn lookup(&self, tunnel_id: &str) -> Option<Arc<TunnelConnection>> {
        self.connections
            .get(tunnel_id)
            .map(|entry| entry.value().clone())
    }

    pub fn is_connected(&self, tunnel_id: &str) -> bool {
        self.connections.contains_key(tunnel_id)
    }

    /// Snapshot of every live connection
    pub fn connections(&self) -> Vec<Arc<TunnelConnection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use webvpn_common::ProxyRequest;

    fn connect(registry: &ConnectionRegistry, id: &str) -> (Arc<TunnelConnection>, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(16);
        let connection = registry.register(ConnectionInfo::new(id, None, None), tx);
        (connection, rx)
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.lookup("nas").is_none());
        assert!(!registry.is_connected("nas"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (connection, _rx) = connect(&registry, "nas");

        let found = registry.lookup("nas").unwrap();
        assert_eq!(found.connection_id(), connection.connection_id());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_replacement_fails_pending_with_replaced() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (first, mut first_rx) = connect(&registry, "nas");

        let dispatcher = {
            let first = first.clone();
            tokio::spawn(async move {
                first
                    .dispatch(ProxyRequest::new("r1", "GET", "/"), Duration::from_secs(5))
                    .await
            })
        };
        // Wait until the frame is on the wire so the request is pending
        assert!(first_rx.recv().await.is_some());

        let (second, _second_rx) = connect(&registry, "nas");

        assert_eq!(dispatcher.await.unwrap(), Err(RelayError::ConnectionReplaced));
        assert!(first.is_closed());
        assert!(*first.shutdown_signal().borrow());
        assert_eq!(
            registry.lookup("nas").unwrap().connection_id(),
            second.connection_id()
        );
    }

    #[tokio::test]
    async fn test_unregister_fails_pending_with_closed() {
        let registry = ConnectionRegistry::new();
        let (connection, mut rx) = connect(&registry, "nas");

        let (result, removed) = tokio::join!(
            connection.dispatch(ProxyRequest::new("r1", "GET", "/"), Duration::from_secs(5)),
            async {
                rx.recv().await;
                registry.unregister(&connection)
            }
        );

        assert!(removed);
        assert_eq!(result, Err(RelayError::ConnectionClosed));
        assert!(registry.lookup("nas").is_none());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (connection, _rx) = connect(&registry, "nas");

        assert!(registry.unregister(&connection));
        assert!(!registry.unregister(&connection));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_unregister_keeps_replacement() {
        let registry = ConnectionRegistry::new();
        let (old, _old_rx) = connect(&registry, "nas");
        let (new, _new_rx) = connect(&registry, "nas");

        // The replaced socket closing later must not evict its successor
        assert!(!registry.unregister(&old));
        assert_eq!(
            registry.lookup("nas").unwrap().connection_id(),
            new.connection_id()
        );
    }

    #[test]
    fn test_identifiers_are_independent() {
        let registry = ConnectionRegistry::new();
        let (a, _a_rx) = connect(&registry, "a");
        let (_b, _b_rx) = connect(&registry, "b");

        registry.unregister(&a);
        assert!(registry.is_connected("b"));
        assert_eq!(registry.connections().len(), 1);
    }
}
