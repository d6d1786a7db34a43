//! Inbound agent frames

use tracing::{debug, warn};

use crate::AppState;
use crate::registry::{OutboundFrame, TunnelConnection};
use crate::relay::FrameOutcome;

/// Route one agent frame to its waiting request and answer the agent when needed
pub async fn handle_agent_frame(
    state: &AppState,
    connection: &TunnelConnection,
    text: &str,
) -> FrameOutcome {
    let outcome = connection.handle_frame(text);

    if outcome.is_liveness() {
        state.presence.touch(connection.info()).await;
    }
    if let FrameOutcome::Delivered { request_id } = &outcome {
        debug!(tunnel_id = %connection.tunnel_id(), request_id = %request_id, "Reply delivered");
    }

    if let Some(reply) = outcome.reply() {
        match serde_json::to_string(&reply) {
            Ok(text) => {
                if connection.outbound.send(OutboundFrame::notice(text)).await.is_err() {
                    debug!(tunnel_id = %connection.tunnel_id(), "Agent writer gone, reply dropped");
                }
            }
            Err(e) => warn!("Failed to serialize agent reply: {}", e),
        }
    }

    outcome
}
