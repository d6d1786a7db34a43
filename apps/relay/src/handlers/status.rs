//! Presence status for dashboard viewers
//!
//! Both the polling endpoint and the push socket only report endpoints the caller may
//! view.

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};
use webvpn_common::PresenceRecord;

use crate::AppState;
use crate::access::may_view;
use crate::auth::CallerIdentity;
use crate::error_handling::GatewayError;

/// Pushed over `{base}/ws/status`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatusMessage {
    Status { clients: Vec<PresenceRecord> },
}

/// Returned by `{base}/webvpn-api/clients/status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub clients: Vec<PresenceRecord>,
}

/// Presence of every endpoint `caller` may view, sorted by identifier
pub async fn snapshot_for(
    state: &AppState,
    caller: &CallerIdentity,
) -> Result<Vec<PresenceRecord>, GatewayError> {
    let ids: Vec<String> = state
        .endpoints
        .list()
        .await?
        .into_iter()
        .filter(|endpoint| may_view(caller, endpoint))
        .map(|endpoint| endpoint.id)
        .collect();
    Ok(state.presence.snapshot(&ids).await)
}

/// `GET {base}/webvpn-api/clients/status`
pub async fn status_snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<StatusSnapshot>, GatewayError> {
    let caller = state
        .sessions
        .authenticate(&headers)
        .ok_or(GatewayError::Unauthenticated {
            login_redirect: None,
        })?;
    let clients = snapshot_for(&state, &caller).await?;
    Ok(Json(StatusSnapshot { clients }))
}

/// `GET {base}/ws/status`
pub async fn status_socket(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(caller) = state.sessions.authenticate(&headers) else {
        return GatewayError::Unauthenticated {
            login_redirect: None,
        }
        .into_response();
    };
    ws.on_upgrade(move |socket| push_status(state, socket, caller))
}

async fn push_status(state: AppState, socket: WebSocket, caller: CallerIdentity) {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = interval(state.config.status_broadcast_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(user_id = %caller.user_id, "Status viewer connected");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let message = match snapshot_for(&state, &caller).await {
                    Ok(clients) => StatusMessage::Status { clients },
                    Err(e) => {
                        warn!(user_id = %caller.user_id, "Status snapshot failed: {}", e);
                        continue;
                    }
                };
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to serialize status: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }
    debug!(user_id = %caller.user_id, "Status viewer disconnected");
}
