//! Tunnel gateway
//!
//! Serves `{base}/tunnel/{id}/...` for authenticated browsers: checks access to the
//! endpoint, forwards the request to its agent and rewrites the reply so the upstream
//! application keeps working under the tunnel prefix.

use axum::body::{Body, Bytes};
use axum::extract::{OriginalUri, Path, State};
use axum::http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_ENCODING, CONTENT_TYPE, COOKIE, HOST, LOCATION, SET_COOKIE,
    TRANSFER_ENCODING,
};
use axum::http::{Extensions, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, info, warn};
use webvpn_common::validation::validate_path;
use webvpn_common::{EndpointConfig, ProxyRequest, ProxyResponse, generate_request_id, now_rfc3339, values_to_header_map};

use super::connect::caller_ip;
use crate::AppState;
use crate::access::{AccessLogEntry, may_view};
use crate::auth::{CallerIdentity, bearer_token, extract_session_token, wants_html};
use crate::content_rewrite::{RewriteContext, rewrite_response_body};
use crate::cookies::{rewrite_location, rewrite_set_cookie, strip_gateway_cookies, tunnel_cookie};
use crate::error_handling::GatewayError;
use crate::interceptor::strip_base_path;
use crate::relay::{AgentReply, RelayError, forward};

/// Request headers passed through to the upstream service
const FORWARDED_HEADERS: [&str; 12] = [
    "accept",
    "accept-language",
    "user-agent",
    "content-type",
    "content-length",
    "authorization",
    "cookie",
    "origin",
    "referer",
    "x-requested-with",
    "x-csrf-token",
    "x-xsrf-token",
];

#[derive(Debug, Deserialize)]
pub struct TunnelParams {
    pub id: String,
    pub rest: Option<String>,
}

/// One inbound request bound for a tunnel
#[derive(Debug)]
pub struct ProxyCall {
    pub tunnel_id: String,
    /// Path below the tunnel prefix, always starting with `/`
    pub app_path: String,
    pub query: Option<String>,
    pub method: Method,
    pub headers: HeaderMap,
    pub peer: Option<SocketAddr>,
    pub body: Bytes,
    /// Path as requested by the browser, for the login redirect
    pub original_path: String,
}

/// `ANY {base}/tunnel/{id}[/{*rest}]`
pub async fn proxy_tunnel(
    State(state): State<AppState>,
    Path(params): Path<TunnelParams>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    headers: HeaderMap,
    extensions: Extensions,
    body: Bytes,
) -> Response {
    debug!(tunnel_id = %params.id, rest = ?params.rest, "Tunnel request");
    let app_path = app_path_after_tunnel(uri.path(), &state.config.base_path, &params.id);
    let call = ProxyCall {
        tunnel_id: params.id,
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

pub(crate) fn peer_addr(extensions: &Extensions) -> Option<SocketAddr> {
    extensions
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

/// Path below `{base}/tunnel/{id}`, `/` when empty
pub fn app_path_after_tunnel(raw_path: &str, base_path: &str, tunnel_id: &str) -> String {
    let prefix = format!("/tunnel/{}", tunnel_id);
    match strip_base_path(raw_path, base_path).strip_prefix(&prefix) {
        Some("") | None => "/".to_string(),
        Some(rest) => rest.to_string(),
    }
}

/// Mount `path` under the endpoint's upstream base path without prefixing it twice
pub fn apply_upstream_base_path(path: &str, base_path: &str) -> String {
    if base_path.is_empty() {
        return path.to_string();
    }
    if path.is_empty() || path == "/" {
        return format!("{}/", base_path);
    }
    if path == base_path || path.starts_with(&format!("{}/", base_path)) {
        return path.to_string();
    }
    if path.starts_with('/') {
        format!("{}{}", base_path, path)
    } else {
        format!("{}/{}", base_path, path)
    }
}

/// Whitelisted request headers, with the gateway's own cookies removed. An
/// `Authorization` header carrying the caller's session token stays at the gateway.
pub fn forward_request_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let session_bearer = bearer_token(headers)
        .is_some_and(|token| extract_session_token(headers).as_deref() == Some(token.as_str()));

    let mut forwarded = HashMap::new();
    for name in FORWARDED_HEADERS {
        if session_bearer && name == AUTHORIZATION.as_str() {
            continue;
        }
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            continue;
        }

        if name == COOKIE.as_str() {
            if let Some(cookie) = strip_gateway_cookies(&values.join("; ")) {
                forwarded.insert(name.to_string(), cookie);
            }
        } else {
            forwarded.insert(name.to_string(), values.join(", "));
        }
    }
    forwarded
}

/// `scheme://host` the browser used to reach the gateway
pub fn public_origin(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let host = header("x-forwarded-host").or_else(|| header(HOST.as_str()))?;
    let proto = header("x-forwarded-proto").unwrap_or_else(|| "http".to_string());
    Some(format!("{}://{}", proto, host))
}

fn unauthenticated(state: &AppState, headers: &HeaderMap, original_path: &str) -> GatewayError {
    let login_redirect = wants_html(headers).then(|| {
        let from: String = url::form_urlencoded::byte_serialize(original_path.as_bytes()).collect();
        format!(
            "{}{}?from={}",
            state.config.base_path, state.config.login_path, from
        )
    });
    GatewayError::Unauthenticated { login_redirect }
}

/// Resolve the endpoint behind `tunnel_id` for `caller`.
///
/// Non-admins learn nothing about endpoints they cannot see: unknown ids are 403 for
/// them and 404 only for admins.
pub async fn authorize_endpoint(
    state: &AppState,
    caller: &CallerIdentity,
    tunnel_id: &str,
) -> Result<EndpointConfig, GatewayError> {
    let endpoint = match state.endpoints.get(tunnel_id).await? {
        Some(endpoint) => endpoint,
        None if caller.is_admin() => return Err(GatewayError::EndpointNotFound),
        None => return Err(GatewayError::Forbidden),
    };
    if !may_view(caller, &endpoint) {
        return Err(GatewayError::Forbidden);
    }
    if !endpoint.active {
        return Err(GatewayError::EndpointInactive);
    }
    Ok(endpoint)
}

/// Authenticate, authorize, forward and rewrite one tunnel request
pub(crate) async fn proxy(state: &AppState, call: ProxyCall) -> Result<Response, GatewayError> {
    let caller = state
        .sessions
        .authenticate(&call.headers)
        .ok_or_else(|| unauthenticated(state, &call.headers, &call.original_path))?;
    let endpoint = authorize_endpoint(state, &caller, &call.tunnel_id).await?;
    let app_path =
        validate_path(&call.app_path).map_err(|e| GatewayError::BadRequest(e.to_string()))?;

    let with_query = |path: &str| match &call.query {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    };
    let upstream_path = apply_upstream_base_path(&app_path, &endpoint.normalized_base_path());
    let applied_base_path = upstream_path != app_path;
    let forward_headers = forward_request_headers(&call.headers);

    let mut final_path = with_query(&upstream_path);
    let mut reply =
        into_response(send_upstream(state, &call, &forward_headers, final_path.clone()).await?)?;

    let retry_allowed = matches!(call.method, Method::GET | Method::HEAD);
    if reply.is_not_found()
        && applied_base_path
        && retry_allowed
        && state.config.retry_without_base_path
    {
        let fallback_path = with_query(&app_path);
        debug!(tunnel_id = %call.tunnel_id, path = %fallback_path, "Retrying without upstream base path");
        match send_upstream(state, &call, &forward_headers, fallback_path.clone()).await {
            Ok(AgentReply::Response(fallback)) if !fallback.is_not_found() => {
                reply = fallback;
                final_path = fallback_path;
            }
            Ok(_) => {}
            Err(e) => debug!(tunnel_id = %call.tunnel_id, "Retry without base path failed: {}", e),
        }
    }

    info!(
        tunnel_id = %call.tunnel_id,
        method = %call.method,
        path = %final_path,
        status = reply.status,
        "Proxied request"
    );
    record_access(state, &call, &caller, &final_path, reply.status).await;

    let origin = public_origin(&call.headers);
    let ctx = RewriteContext {
        tunnel_id: &call.tunnel_id,
        gateway_base_path: &state.config.base_path,
        public_origin: origin.as_deref(),
        upstream_port: endpoint.upstream_port,
        local_hosts: &state.config.local_hosts,
    };
    build_response(reply, &ctx)
}

async fn send_upstream(
    state: &AppState,
    call: &ProxyCall,
    headers: &HashMap<String, String>,
    path: String,
) -> Result<AgentReply, RelayError> {
    let mut request =
        ProxyRequest::new(generate_request_id(), call.method.as_str(), path).with_body(&call.body);
    request.headers = headers.clone();
    forward(&state.registry, &call.tunnel_id, request, state.config.request_timeout).await
}

fn into_response(reply: AgentReply) -> Result<ProxyResponse, GatewayError> {
    match reply {
        AgentReply::Response(response) => Ok(response),
        AgentReply::Failure(error) => Err(GatewayError::AgentReported(error)),
    }
}

async fn record_access(
    state: &AppState,
    call: &ProxyCall,
    caller: &CallerIdentity,
    path: &str,
    status: u16,
) {
    let entry = AccessLogEntry {
        tunnel_id: call.tunnel_id.clone(),
        caller_id: caller.user_id.clone(),
        method: call.method.to_string(),
        path: path.to_string(),
        status,
        ip: caller_ip(&call.headers, call.peer).unwrap_or_default(),
        timestamp: now_rfc3339(),
    };
    if let Err(e) = state.access_log.append(entry).await {
        warn!(tunnel_id = %call.tunnel_id, "Failed to append access log: {:#}", e);
    }
    state.presence.record_access(&call.tunnel_id).await;
}

/// Turn an agent response into the response sent to the browser
pub fn build_response(reply: ProxyResponse, ctx: &RewriteContext<'_>) -> Result<Response, GatewayError> {
    let status = StatusCode::from_u16(reply.status)
        .map_err(|_| GatewayError::DispatchFailed(format!("Invalid status {}", reply.status)))?;
    let body = reply
        .decoded_body()
        .map_err(|e| GatewayError::DispatchFailed(format!("Invalid response body: {}", e)))?;

    let mut headers = values_to_header_map(&reply.headers);
    let set_cookies: Vec<String> = reply.header_values(SET_COOKIE.as_str()).map(str::to_string).collect();
    let location = reply.header(LOCATION.as_str()).map(str::to_string);
    for name in [SET_COOKIE, LOCATION, TRANSFER_ENCODING, CONNECTION] {
        headers.remove(name);
    }

    let outcome = rewrite_response_body(
        body,
        reply.header(CONTENT_ENCODING.as_str()),
        reply.header(CONTENT_TYPE.as_str()),
        ctx,
    );
    outcome.apply_to_headers(&mut headers);

    headers.insert("x-webvpn-proxy", HeaderValue::from_static("1"));
    for (name, value) in outcome.diagnostic_headers() {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }

    let tunnel_base_path = ctx.tunnel_base_path();
    for cookie in set_cookies {
        if let Ok(value) = HeaderValue::from_str(&rewrite_set_cookie(&cookie, &tunnel_base_path)) {
            headers.append(SET_COOKIE, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&tunnel_cookie(ctx.tunnel_id)) {
        headers.append(SET_COOKIE, value);
    }
    if let Some(location) = location {
        if let Ok(value) = HeaderValue::from_str(&rewrite_location(&location, &tunnel_base_path)) {
            headers.insert(LOCATION, value);
        }
    }

    let mut response = Response::new(Body::from(outcome.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use webvpn_common::{HeaderValues, encode_body};

    #[test]
    fn test_app_path_after_tunnel() {
        assert_eq!(app_path_after_tunnel("/tunnel/nas", "", "nas"), "/");
        assert_eq!(app_path_after_tunnel("/tunnel/nas/", "", "nas"), "/");
        assert_eq!(app_path_after_tunnel("/vpn/tunnel/nas/a/b%20c", "/vpn", "nas"), "/a/b%20c");
    }

    #[test]
    fn test_apply_upstream_base_path() {
        assert_eq!(apply_upstream_base_path("/api", ""), "/api");
        assert_eq!(apply_upstream_base_path("/", "/app"), "/app/");
        assert_eq!(apply_upstream_base_path("/api", "/app"), "/app/api");
        assert_eq!(apply_upstream_base_path("/app/api", "/app"), "/app/api");
        assert_eq!(apply_upstream_base_path("/app", "/app"), "/app");
        assert_eq!(apply_upstream_base_path("/application", "/app"), "/app/application");
    }

    #[test]
    fn test_forward_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("accept", HeaderValue::from_static("text/html"));
        headers.insert("x-forwarded-for", HeaderValue::from_static("1.2.3.4"));
        headers.insert(HOST, HeaderValue::from_static("portal.example"));
        headers.insert(
            COOKIE,
            HeaderValue::from_static("webvpn.session-token=abc; sid=1; webvpn_tunnel=nas"),
        );

        let forwarded = forward_request_headers(&headers);
        assert_eq!(forwarded.get("accept").map(String::as_str), Some("text/html"));
        assert_eq!(forwarded.get("cookie").map(String::as_str), Some("sid=1"));
        assert!(!forwarded.contains_key("x-forwarded-for"));
        assert!(!forwarded.contains_key("host"));

        let mut only_gateway = HeaderMap::new();
        only_gateway.insert(COOKIE, HeaderValue::from_static("webvpn_tunnel=nas"));
        assert!(forward_request_headers(&only_gateway).is_empty());
    }

    #[test]
    fn test_session_bearer_is_not_forwarded() {
        let mut bearer_session = HeaderMap::new();
        bearer_session.insert(AUTHORIZATION, HeaderValue::from_static("Bearer session-jwt"));
        assert!(!forward_request_headers(&bearer_session).contains_key("authorization"));

        // The cookie authenticated the caller; the bearer belongs to the upstream app
        let mut app_bearer = bearer_session.clone();
        app_bearer.insert(COOKIE, HeaderValue::from_static("webvpn.session-token=cookie-jwt"));
        assert_eq!(
            forward_request_headers(&app_bearer).get("authorization").map(String::as_str),
            Some("Bearer session-jwt")
        );

        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwdw=="));
        assert_eq!(
            forward_request_headers(&basic).get("authorization").map(String::as_str),
            Some("Basic dXNlcjpwdw==")
        );
    }

    #[test]
    fn test_public_origin() {
        let mut headers = HeaderMap::new();
        assert_eq!(public_origin(&headers), None);
        headers.insert(HOST, HeaderValue::from_static("relay.internal:8080"));
        assert_eq!(public_origin(&headers).as_deref(), Some("http://relay.internal:8080"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("portal.example"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(public_origin(&headers).as_deref(), Some("https://portal.example"));
    }

    #[tokio::test]
    async fn test_build_response_rewrites_headers() {
        let hosts = vec!["localhost".to_string()];
        let ctx = RewriteContext {
            tunnel_id: "abc123",
            gateway_base_path: "",
            public_origin: None,
            upstream_port: 3000,
            local_hosts: &hosts,
        };
        let mut reply = ProxyResponse::new("r1", 302);
        reply.headers.insert(
            "Set-Cookie".to_string(),
            HeaderValues::Many(vec![
                "sid=abc; Path=/; Domain=internal.example".to_string(),
                "theme=dark".to_string(),
            ]),
        );
        reply.headers.insert(
            "location".to_string(),
            HeaderValues::One("http://localhost:3000/login?next=%2F".to_string()),
        );
        reply.headers.insert("connection".to_string(), HeaderValues::One("close".to_string()));
        reply.body = encode_body(b"moved");

        let response = build_response(reply, &ctx).unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);

        let headers = response.headers();
        let cookies: Vec<&str> = headers
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert!(cookies.contains(&"sid=abc; Path=/tunnel/abc123"));
        assert!(cookies.contains(&"theme=dark; Path=/tunnel/abc123"));
        assert!(cookies.iter().any(|c| c.starts_with("webvpn_tunnel=abc123;")));
        assert_eq!(headers[LOCATION], "/tunnel/abc123/login?next=%2F");
        assert!(!headers.contains_key(CONNECTION));
        assert_eq!(headers["x-webvpn-proxy"], "1");
        assert_eq!(headers["x-webvpn-html"], "0");
        assert_eq!(headers["x-webvpn-encoding"], "none");
    }

    #[test]
    fn test_build_response_rejects_bad_body() {
        let hosts = Vec::new();
        let ctx = RewriteContext {
            tunnel_id: "abc123",
            gateway_base_path: "",
            public_origin: None,
            upstream_port: 3000,
            local_hosts: &hosts,
        };
        let mut reply = ProxyResponse::new("r1", 200);
        reply.body = "!!not base64!!".to_string();
        let err = build_response(reply, &ctx).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
}
