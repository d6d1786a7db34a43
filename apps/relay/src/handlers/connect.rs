//! Agent WebSocket sessions
//!
//! An agent dials `{base}/ws?key=...&version=...`. The socket is upgraded first so that
//! authentication failures can be reported with a close code the agent understands.

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{Extensions, HeaderMap};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};
use webvpn_common::constants::OUTBOUND_BUFFER_FRAMES;

use super::disconnect::handle_disconnect;
use super::response::handle_agent_frame;
use crate::AppState;
use crate::auth::extract_agent_key;
use crate::registry::{ConnectionInfo, OutboundFrame, TunnelConnection};
use crate::relay::RelayError;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectQuery {
    pub key: Option<String>,
    pub version: Option<String>,
}

/// First `x-forwarded-for` entry, else the socket peer
pub fn caller_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|first| first.trim().to_string())
        .filter(|first| !first.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// `GET {base}/ws`
pub async fn agent_socket(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    extensions: Extensions,
    ws: WebSocketUpgrade,
) -> Response {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let remote_ip = caller_ip(&headers, peer);
    let key = extract_agent_key(&headers, query.key.as_deref());
    let version = query.version.filter(|v| !v.is_empty());

    ws.on_upgrade(move |socket| {
        let span = info_span!("agent", ip = remote_ip.as_deref().unwrap_or("-"));
        run_agent_session(state, socket, key, version, remote_ip).instrument(span)
    })
}

async fn run_agent_session(
    state: AppState,
    socket: WebSocket,
    key: Option<String>,
    version: Option<String>,
    remote_ip: Option<String>,
) {
    let (mut sink, mut stream) = socket.split();

    let credential = match state.authenticator.authenticate(key.as_deref()).await {
        Ok(credential) => credential,
        Err(e) => {
            warn!("Agent rejected: {}", e);
            let frame = CloseFrame {
                code: e.close_code(),
                reason: e.close_reason().into(),
            };
            let _ = sink.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    let info = ConnectionInfo::new(credential.tunnel_id.clone(), version, remote_ip);
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER_FRAMES);
    let connection = state.registry.register(info.clone(), outbound);
    state.presence.mark_online(&info).await;
    info!(
        tunnel_id = %info.tunnel_id,
        connection_id = connection.connection_id(),
        version = info.version.as_deref().unwrap_or("-"),
        "Agent connected"
    );

    let writer = tokio::spawn(write_frames(connection.clone(), sink, outbound_rx));

    let mut shutdown = connection.shutdown_signal();
    loop {
        tokio::select! {
            _ = async { shutdown.wait_for(|closed| *closed).await.map(|_| ()) } => {
                debug!(tunnel_id = %info.tunnel_id, "Connection closed by relay");
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    handle_agent_frame(&state, &connection, text.as_str()).await;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    handle_agent_frame(&state, &connection, &String::from_utf8_lossy(&bytes)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(tunnel_id = %info.tunnel_id, "Agent closed the socket: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(tunnel_id = %info.tunnel_id, "Agent socket error: {}", e);
                    break;
                }
                None => break,
            }
        }
    }

    handle_disconnect(&state, &connection).await;
    if let Err(e) = writer.await {
        warn!(tunnel_id = %info.tunnel_id, "Writer task failed: {}", e);
    }
}

/// Drain queued frames onto the socket until the connection shuts down
async fn write_frames(
    connection: Arc<TunnelConnection>,
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<OutboundFrame>,
) {
    let mut shutdown = connection.shutdown_signal();
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.wait_for(|closed| *closed) => break,
        };

        if let Err(e) = sink.send(Message::Text(frame.text.into())).await {
            warn!(tunnel_id = %connection.tunnel_id(), "Failed to write to agent: {}", e);
            if let Some(request_id) = frame.request_id {
                connection.settle(&request_id, Err(RelayError::DispatchFailed(e.to_string())));
            }
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_caller_ip() {
        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(caller_ip(&headers, Some(peer)).as_deref(), Some("10.1.2.3"));
        assert_eq!(caller_ip(&headers, None), None);

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(caller_ip(&headers, Some(peer)).as_deref(), Some("203.0.113.7"));
    }
}
