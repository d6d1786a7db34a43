//! Routing for stray root-relative requests
//!
//! A tunneled page without an active service worker still requests `/api/...` or
//! `/static/...` from the site root. Such requests are sent to the tunnel named by the
//! `Referer`, or else by the `webvpn_tunnel` cookie set on the last proxied response.

use axum::body::Bytes;
use axum::extract::{OriginalUri, State};
use axum::http::header::{COOKIE, REFERER};
use axum::http::{Extensions, HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use tracing::debug;
use webvpn_common::validation::validate_tunnel_id;

use super::forwarding::{ProxyCall, peer_addr, proxy};
use crate::AppState;
use crate::cookies::{TUNNEL_COOKIE, cookie_value};
use crate::error_handling::GatewayError;
use crate::interceptor::resolve_stray_request;

pub async fn stray_request(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Response {
    let referer = headers.get(REFERER).and_then(|v| v.to_str().ok());
    let cookies = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect::<Vec<_>>()
        .join("; ");
    let remembered = cookie_value(&cookies, TUNNEL_COOKIE);

    let target = resolve_stray_request(
        uri.path(),
        &state.config.base_path,
        referer,
        remembered.as_deref(),
    )
    .filter(|(tunnel_id, _)| validate_tunnel_id(tunnel_id).is_ok());

    let Some((tunnel_id, app_path)) = target else {
        return GatewayError::NotFound.into_response();
    };
    debug!(tunnel_id = %tunnel_id, path = %app_path, "Routing stray request into tunnel");

    let call = ProxyCall {
        tunnel_id,
        app_path,
        query: uri.query().map(str::to_string),
        method,
        headers,
        peer: peer_addr(&extensions),
        body,
        original_path: uri.path().to_string(),
    };
    match proxy(&state, call).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}
