//! Agent disconnect cleanup

use tracing::info;

use crate::AppState;
use crate::registry::TunnelConnection;

/// Unregister `connection` and clear its online flag.
///
/// Only the registration that still owns the mapping clears presence, so a stale
/// session closing after its replacement connected leaves the new one online.
pub async fn handle_disconnect(state: &AppState, connection: &TunnelConnection) {
    let pending = connection.pending_count();
    if state.registry.unregister(connection) {
        state.presence.mark_offline(connection.tunnel_id()).await;
        info!(
            tunnel_id = %connection.tunnel_id(),
            connection_id = connection.connection_id(),
            failed_requests = pending,
            "Agent disconnected"
        );
    } else {
        info!(
            tunnel_id = %connection.tunnel_id(),
            connection_id = connection.connection_id(),
            "Superseded agent session ended"
        );
    }
}
