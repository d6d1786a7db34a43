//! Relay protocol engine
//!
//! Dispatches request frames over a [`TunnelConnection`] and correlates the agent's
//! replies by request id. Each dispatched request has exactly one outcome: the agent's
//! reply, a timeout, or a connection-level failure.

use dashmap::mapref::entry::Entry;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{self, Instant};
use tracing::{debug, warn};
use webvpn_common::{
    AgentMessage, ControlFrame, ProxyFailure, ProxyRequest, ProxyResponse, RelayMessage,
};

use crate::registry::{ConnectionRegistry, OutboundFrame, PendingRequest, TunnelConnection};

/// Failures of a single dispatch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("Client offline")]
    AgentOffline,

    #[error("Proxy timeout")]
    Timeout,

    #[error("Connection replaced")]
    ConnectionReplaced,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Dispatch failed: {0}")]
    DispatchFailed(String),
}

/// What the agent answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    Response(ProxyResponse),
    /// The agent could not serve the request, e.g. the local service refused it
    Failure(String),
}

/// Result of processing one inbound agent frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Heartbeat,
    Delivered { request_id: String },
    /// No caller is waiting for this id (timed out, cancelled or never sent)
    Unknown { request_id: String },
    Invalid(String),
    Ignored,
}

impl FrameOutcome {
    /// Frame to send back to the agent, if any
    pub fn reply(&self) -> Option<ProxyFailure> {
        match self {
            FrameOutcome::Unknown { request_id } => {
                Some(ProxyFailure::for_request(request_id.clone(), "Unknown request"))
            }
            FrameOutcome::Invalid(_) => Some(ProxyFailure::without_request("Invalid message")),
            _ => None,
        }
    }

    /// Whether the frame proves the agent is alive
    pub fn is_liveness(&self) -> bool {
        matches!(
            self,
            FrameOutcome::Heartbeat | FrameOutcome::Delivered { .. }
        )
    }
}

/// Removes the pending entry if the dispatching future is dropped before resolution
struct PendingGuard<'a> {
    connection: &'a TunnelConnection,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.connection.pending.remove(self.request_id);
    }
}

impl TunnelConnection {
    /// Send `request` to the agent and wait for its reply, at most `timeout`.
    ///
    /// A timeout only abandons this request; the connection keeps serving others.
    pub async fn dispatch(
        &self,
        request: ProxyRequest,
        timeout: Duration,
    ) -> Result<AgentReply, RelayError> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }

        let request_id = request.id.clone();
        let text = RelayMessage::Request(request)
            .to_text()
            .map_err(|e| RelayError::DispatchFailed(e.to_string()))?;

        let deadline = Instant::now() + timeout;
        let (resolve, mut completion) = oneshot::channel();
        match self.pending.entry(request_id.clone()) {
            Entry::Occupied(_) => {
                return Err(RelayError::DispatchFailed(format!(
                    "request id {} is already outstanding",
                    request_id
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest { resolve, deadline });
            }
        }
        let _guard = PendingGuard {
            connection: self,
            request_id: &request_id,
        };

        // A close that raced with the insert above has either drained our entry or
        // is visible here.
        if self.is_closed() {
            self.settle(&request_id, Err(RelayError::ConnectionClosed));
        } else {
            let frame = OutboundFrame {
                text,
                request_id: Some(request_id.clone()),
            };
            match time::timeout_at(deadline, self.outbound.send(frame)).await {
                Ok(Ok(())) => {
                    debug!(tunnel_id = %self.tunnel_id(), request_id = %request_id, "Dispatched request");
                }
                Ok(Err(_)) => {
                    self.settle(
                        &request_id,
                        Err(RelayError::DispatchFailed(
                            "agent connection is not writable".to_string(),
                        )),
                    );
                }
                Err(_) => {
                    self.settle(&request_id, Err(RelayError::Timeout));
                }
            }
        }

        let waited = time::timeout_at(deadline, &mut completion).await;
        let outcome = match waited {
            Ok(received) => received,
            Err(_) => {
                if self.settle(&request_id, Err(RelayError::Timeout)) {
                    warn!(
                        tunnel_id = %self.tunnel_id(),
                        request_id = %request_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Request timed out waiting for agent"
                    );
                }
                // Whoever settled first has already sent the outcome
                completion.await
            }
        };

        outcome.unwrap_or(Err(RelayError::ConnectionClosed))
    }

    /// Process one text frame received from the agent
    pub fn handle_frame(&self, text: &str) -> FrameOutcome {
        let message = match AgentMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(tunnel_id = %self.tunnel_id(), "Invalid agent frame: {}", e);
                return FrameOutcome::Invalid(e.to_string());
            }
        };

        match message {
            AgentMessage::Control(ControlFrame::Heartbeat) => FrameOutcome::Heartbeat,
            AgentMessage::Failure(ProxyFailure { id: None, error }) => {
                warn!(tunnel_id = %self.tunnel_id(), "Agent reported error without request id: {}", error);
                FrameOutcome::Ignored
            }
            AgentMessage::Failure(ProxyFailure {
                id: Some(id),
                error,
            }) => self.deliver(id, AgentReply::Failure(error)),
            AgentMessage::Response(response) => {
                let id = response.id.clone();
                self.deliver(id, AgentReply::Response(response))
            }
        }
    }

    fn deliver(&self, request_id: String, reply: AgentReply) -> FrameOutcome {
        if self.settle(&request_id, Ok(reply)) {
            FrameOutcome::Delivered { request_id }
        } else {
            warn!(
                tunnel_id = %self.tunnel_id(),
                request_id = %request_id,
                "Reply for unknown request"
            );
            FrameOutcome::Unknown { request_id }
        }
    }

    /// Time out every pending request whose deadline has passed
    pub(crate) fn expire_overdue(&self, now: Instant) -> usize {
        let overdue: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.value().deadline <= now)
            .map(|entry| entry.key().clone())
            .collect();

        overdue
            .iter()
            .filter(|id| self.settle(id, Err(RelayError::Timeout)))
            .count()
    }
}

/// Look up the live connection for `tunnel_id` and dispatch `request` over it
pub async fn forward(
    registry: &ConnectionRegistry,
    tunnel_id: &str,
    request: ProxyRequest,
    timeout: Duration,
) -> Result<AgentReply, RelayError> {
    let connection = registry
        .lookup(tunnel_id)
        .ok_or(RelayError::AgentOffline)?;
    connection.dispatch(request, timeout).await
}
