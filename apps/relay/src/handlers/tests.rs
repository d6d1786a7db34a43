//! End-to-end gateway tests
//!
//! Requests go through the full router; agents are simulated by registering a
//! connection and answering the frames queued on its outbound channel.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::header::{ACCEPT, AUTHORIZATION, CONTENT_ENCODING, COOKIE, LOCATION, REFERER, SET_COOKIE};
use axum::http::{Request, Response, StatusCode};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceExt;
use webvpn_common::{
    EndpointConfig, HeaderValues, ProxyFailure, ProxyRequest, ProxyResponse, RelayMessage,
    encode_body, key_prefix,
};
use webvpn_common::constants::{HEARTBEAT_INTERVAL_SECS, STATUS_TTL_SECS};
use webvpn_common::validation::MAX_PATH_LENGTH;

use crate::access::MemoryEndpointStore;
use crate::access::tests::{RecordingAccessLog, endpoint};
use crate::auth::tests::{SECRET, token_for};
use crate::config::RelayConfig;
use crate::credentials::{AgentAuthenticator, FileCredentialStore};
use crate::handlers::{handle_agent_frame, run_liveness_sweep};
use crate::presence::MemoryPresenceStore;
use crate::registry::{ConnectionInfo, TunnelConnection};
use crate::{AppState, RelayState, build_router};

struct Harness {
    state: AppState,
    access_log: Arc<RecordingAccessLog>,
}

impl Harness {
    fn new(endpoints: Vec<EndpointConfig>) -> Self {
        Self::with_config(Self::config(), endpoints)
    }

    fn config() -> RelayConfig {
        RelayConfig::with_secret(String::from_utf8_lossy(SECRET).into_owned())
    }

    fn with_config(config: RelayConfig, endpoints: Vec<EndpointConfig>) -> Self {
        let access_log = Arc::new(RecordingAccessLog::default());
        let state = Arc::new(RelayState::new(
            config,
            Arc::new(MemoryPresenceStore::new()),
            AgentAuthenticator::new(Arc::new(FileCredentialStore::in_memory(Vec::new()))),
            Arc::new(MemoryEndpointStore::new(endpoints)),
            access_log.clone(),
        ));
        Self { state, access_log }
    }

    fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router().oneshot(request).await.unwrap()
    }

    /// Register a simulated agent answering each request with `reply`; `None` stays silent
    fn agent<F>(&self, tunnel_id: &str, reply: F) -> Arc<TunnelConnection>
    where
        F: Fn(ProxyRequest) -> Option<String> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(16);
        let connection = self.state.registry.register(
            ConnectionInfo::new(tunnel_id, Some("1.2.0".to_string()), None),
            tx,
        );
        let agent = connection.clone();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Ok(RelayMessage::Request(request)) = RelayMessage::parse(&frame.text) {
                    if let Some(text) = reply(request) {
                        agent.handle_frame(&text);
                    }
                }
            }
        });
        connection
    }
}

fn session_get(uri: &str, user: &str, permissions: &[&str]) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(COOKIE, format!("webvpn.session-token={}", token_for(user, permissions)))
        .body(Body::empty())
        .unwrap()
}

fn respond(request: &ProxyRequest, status: u16, headers: &[(&str, &str)], body: &[u8]) -> Option<String> {
    let mut response = ProxyResponse::new(request.id.clone(), status);
    for (name, value) in headers {
        response
            .headers
            .insert(name.to_string(), HeaderValues::One(value.to_string()));
    }
    response.body = encode_body(body);
    serde_json::to_string(&response).ok()
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8_lossy(&bytes).into_owned()
}

async fn error_message(response: Response<Body>) -> String {
    let body = body_string(response).await;
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    json["error"].as_str().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_unauthenticated_callers() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);

    let api = Request::builder().uri("/tunnel/nas/api").body(Body::empty()).unwrap();
    let response = harness.send(api).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_message(response).await, "Unauthorized");

    let browser = Request::builder()
        .uri("/tunnel/nas/")
        .header(ACCEPT, "text/html,application/xhtml+xml")
        .body(Body::empty())
        .unwrap();
    let response = harness.send(browser).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[LOCATION], "/unauthorized?from=%2Ftunnel%2Fnas%2F");
}

#[tokio::test]
async fn test_authorization_rules() {
    let mut inactive = endpoint("old", "alice");
    inactive.active = false;
    let harness = Harness::new(vec![endpoint("nas", "alice"), inactive]);

    let response = harness.send(session_get("/tunnel/nas/", "bob", &[])).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = harness.send(session_get("/tunnel/ghost/", "bob", &[])).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = harness
        .send(session_get("/tunnel/ghost/", "root", &["admin.users"]))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = harness.send(session_get("/tunnel/old/", "alice", &[])).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_message(response).await, "Client not available");
}

#[tokio::test]
async fn test_offline_agent() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);
    let response = harness.send(session_get("/tunnel/nas/", "alice", &[])).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_message(response).await, "Client offline");
}

#[tokio::test]
async fn test_gzip_html_is_rewritten_and_logged() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);
    let page = b"<html><head><title>NAS</title></head><body><a href=\"http://localhost:3000/files\">f</a></body></html>";
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(page).unwrap();
    let compressed = encoder.finish().unwrap();

    harness.agent("nas", move |request| {
        respond(
            &request,
            200,
            &[("content-type", "text/html"), ("content-encoding", "gzip")],
            &compressed,
        )
    });

    let mut request = session_get("/tunnel/nas/index.html?tab=2", "alice", &[]);
    request
        .headers_mut()
        .insert("x-forwarded-host", "portal.example".parse().unwrap());
    request
        .headers_mut()
        .insert("x-forwarded-proto", "https".parse().unwrap());
    let response = harness.send(request).await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert!(!headers.contains_key(CONTENT_ENCODING));
    assert_eq!(headers["x-webvpn-injected"], "1");
    assert_eq!(headers["x-webvpn-decoded"], "1");
    assert_eq!(headers["x-webvpn-encoding"], "gzip");
    assert!(
        headers
            .get_all(SET_COOKIE)
            .iter()
            .any(|v| v.to_str().unwrap().starts_with("webvpn_tunnel=nas;"))
    );

    let body = body_string(response).await;
    assert_eq!(headers["x-webvpn-body-len"], body.len().to_string().as_str());
    assert!(body.contains(r#"<head><base data-webvpn-base href="/tunnel/nas/">"#));
    assert!(body.contains(r#"href="https://portal.example/tunnel/nas/files""#));

    let entries = harness.access_log.entries.lock().unwrap().clone();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].caller_id, "alice");
    assert_eq!(entries[0].method, "GET");
    assert_eq!(entries[0].path, "/index.html?tab=2");
    assert_eq!(entries[0].status, 200);

    let record = harness.state.presence.record("nas").await;
    assert!(record.last_access.is_some());
}

#[tokio::test]
async fn test_gateway_cookies_are_not_forwarded() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);
    harness.agent("nas", |request| {
        let cookie = request.headers.get("cookie").cloned().unwrap_or_default();
        respond(&request, 200, &[("content-type", "text/plain")], cookie.as_bytes())
    });

    let request = Request::builder()
        .uri("/tunnel/nas/")
        .header(
            COOKIE,
            format!(
                "webvpn.session-token={}; sid=42; webvpn_tunnel=nas",
                token_for("alice", &[])
            ),
        )
        .body(Body::empty())
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(body_string(response).await, "sid=42");
}

#[tokio::test]
async fn test_session_bearer_stays_at_the_gateway() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);
    harness.agent("nas", |request| {
        let authorization = request.headers.get("authorization").cloned().unwrap_or_default();
        respond(&request, 200, &[("content-type", "text/plain")], authorization.as_bytes())
    });

    let bearer = Request::builder()
        .uri("/tunnel/nas/")
        .header(AUTHORIZATION, format!("Bearer {}", token_for("alice", &[])))
        .body(Body::empty())
        .unwrap();
    let response = harness.send(bearer).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "");

    let mut basic = session_get("/tunnel/nas/", "alice", &[]);
    basic
        .headers_mut()
        .insert(AUTHORIZATION, "Basic dXNlcjpwdw==".parse().unwrap());
    assert_eq!(body_string(harness.send(basic).await).await, "Basic dXNlcjpwdw==");
}

#[tokio::test]
async fn test_retry_without_upstream_base_path() {
    let mut nas = endpoint("nas", "alice");
    nas.upstream_base_path = Some("/app/".to_string());
    let harness = Harness::new(vec![nas]);
    harness.agent("nas", |request| {
        if request.path.starts_with("/app/") {
            respond(&request, 404, &[], b"missing")
        } else {
            respond(&request, 200, &[("content-type", "text/plain")], b"root")
        }
    });

    let response = harness.send(session_get("/tunnel/nas/status", "alice", &[])).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "root");
    assert_eq!(harness.access_log.entries.lock().unwrap()[0].path, "/status");

    let post = Request::builder()
        .method("POST")
        .uri("/tunnel/nas/status")
        .header(COOKIE, format!("webvpn.session-token={}", token_for("alice", &[])))
        .body(Body::from("x=1"))
        .unwrap();
    let response = harness.send(post).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retry_can_be_disabled() {
    let mut nas = endpoint("nas", "alice");
    nas.upstream_base_path = Some("/app".to_string());
    let mut config = Harness::config();
    config.retry_without_base_path = false;
    let harness = Harness::with_config(config, vec![nas]);
    harness.agent("nas", |request| {
        let status = if request.path.starts_with("/app/") { 404 } else { 200 };
        respond(&request, status, &[], b"")
    });

    let response = harness.send(session_get("/tunnel/nas/status", "alice", &[])).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_agent_reported_error() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);
    harness.agent("nas", |request| {
        serde_json::to_string(&ProxyFailure::for_request(request.id, "connect ECONNREFUSED")).ok()
    });

    let response = harness.send(session_get("/tunnel/nas/", "alice", &[])).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(error_message(response).await, "connect ECONNREFUSED");
}

#[tokio::test]
async fn test_silent_agent_times_out() {
    let mut config = Harness::config();
    config.request_timeout = Duration::from_millis(100);
    let harness = Harness::with_config(config, vec![endpoint("nas", "alice")]);
    let connection = harness.agent("nas", |_| None);

    let response = harness.send(session_get("/tunnel/nas/", "alice", &[])).await;
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(error_message(response).await, "Proxy timeout");

    // The connection survives the timeout
    assert!(!connection.is_closed());
    assert_eq!(connection.pending_count(), 0);
    assert!(harness.state.registry.is_connected("nas"));
}

#[tokio::test]
async fn test_stray_request_follows_referer() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);
    harness.agent("nas", |request| {
        respond(&request, 200, &[("content-type", "application/json")], request.path.as_bytes())
    });

    let mut request = session_get("/api/data?page=2", "alice", &[]);
    request.headers_mut().insert(
        REFERER,
        "https://portal.example/tunnel/nas/index.html".parse().unwrap(),
    );
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "/api/data?page=2");

    let response = harness.send(session_get("/api/data", "alice", &[])).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_stray_request_follows_tunnel_cookie_under_base_path() {
    let mut config = Harness::config();
    config.base_path = "/vpn".to_string();
    let harness = Harness::with_config(config, vec![endpoint("nas", "alice")]);
    harness.agent("nas", |request| {
        respond(&request, 200, &[], request.path.as_bytes())
    });

    let request = Request::builder()
        .uri("/static/app.js")
        .header(
            COOKIE,
            format!(
                "webvpn.session-token={}; webvpn_tunnel=nas",
                token_for("alice", &[])
            ),
        )
        .body(Body::empty())
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "/static/app.js");

    let response = harness.send(session_get("/vpn/tunnel/nas/x", "alice", &[])).await;
    assert_eq!(body_string(response).await, "/x");
}

#[tokio::test]
async fn test_service_worker_asset() {
    let mut config = Harness::config();
    config.base_path = "/vpn".to_string();
    let harness = Harness::with_config(config, Vec::new());

    let request = Request::builder().uri("/vpn/webvpn-sw.js").body(Body::empty()).unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/javascript");
    assert_eq!(response.headers()["cache-control"], "no-cache");
    assert_eq!(response.headers()["service-worker-allowed"], "/vpn/");
    assert!(body_string(response).await.contains("WEBVPN_SET_CLIENT"));
}

#[tokio::test]
async fn test_status_snapshot_is_filtered() {
    let harness = Harness::new(vec![endpoint("nas", "alice"), endpoint("db", "bob")]);
    harness
        .state
        .presence
        .mark_online(&ConnectionInfo::new("nas", Some("1.2.0".to_string()), Some("10.0.0.2".to_string())))
        .await;

    let response = harness
        .send(session_get("/webvpn-api/clients/status", "alice", &[]))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    let clients = json["clients"].as_array().unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0]["id"], "nas");
    assert_eq!(clients[0]["online"], true);
    assert_eq!(clients[0]["version"], "1.2.0");

    let response = harness
        .send(session_get("/webvpn-api/clients/status", "root", &["admin.users"]))
        .await;
    let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(json["clients"].as_array().unwrap().len(), 2);

    let anonymous = Request::builder()
        .uri("/webvpn-api/clients/status")
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(anonymous).await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_issue_and_revoke_key() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);
    let token = token_for("alice", &["clients.manage"]);

    let forbidden = Request::builder()
        .method("POST")
        .uri("/webvpn-api/clients/nas/keys")
        .header(COOKIE, format!("webvpn.session-token={}", token_for("alice", &[])))
        .body(Body::empty())
        .unwrap();
    assert_eq!(harness.send(forbidden).await.status(), StatusCode::FORBIDDEN);

    let issue = Request::builder()
        .method("POST")
        .uri("/webvpn-api/clients/nas/keys")
        .header(COOKIE, format!("webvpn.session-token={}", token))
        .body(Body::empty())
        .unwrap();
    let response = harness.send(issue).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let issued: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    let key = issued["key"].as_str().unwrap().to_string();
    let key_id = issued["id"].as_str().unwrap().to_string();
    assert_eq!(issued["keyPrefix"], key_prefix(&key));

    let credential = harness.state.authenticator.authenticate(Some(&key)).await.unwrap();
    assert_eq!(credential.tunnel_id, "nas");

    let revoke = Request::builder()
        .method("DELETE")
        .uri(format!("/webvpn-api/clients/nas/keys/{}", key_id))
        .header(COOKIE, format!("webvpn.session-token={}", token))
        .body(Body::empty())
        .unwrap();
    let response = harness.send(revoke).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(harness.state.authenticator.authenticate(Some(&key)).await.is_err());
}

#[tokio::test]
async fn test_liveness_sweep_refreshes_registered_connections() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);
    let connection = harness.agent("nas", |_| None);

    let report = run_liveness_sweep(&harness.state).await;
    assert_eq!(report.refreshed, 1);
    assert_eq!(report.expired, 0);
    assert!(harness.state.presence.record("nas").await.online);

    assert!(harness.state.registry.unregister(&connection));
    let report = run_liveness_sweep(&harness.state).await;
    assert_eq!(report.refreshed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_presence_survives_status_ttl_while_connected() {
    let harness = Harness::new(vec![endpoint("nas", "alice"), endpoint("db", "alice")]);
    let (tx, _rx) = mpsc::channel(16);
    let heartbeating = harness.state.registry.register(
        ConnectionInfo::new("nas", Some("1.2.0".to_string()), Some("10.0.0.2".to_string())),
        tx,
    );
    let (tx, _quiet_rx) = mpsc::channel(16);
    let swept = harness.state.registry.register(
        ConnectionInfo::new("db", Some("0.9.1".to_string()), Some("10.0.0.3".to_string())),
        tx,
    );
    harness.state.presence.mark_online(heartbeating.info()).await;
    harness.state.presence.mark_online(swept.info()).await;

    let step = Duration::from_secs(HEARTBEAT_INTERVAL_SECS);
    let mut elapsed = Duration::ZERO;
    while elapsed <= Duration::from_secs(STATUS_TTL_SECS + 60) {
        tokio::time::advance(step).await;
        elapsed += step;
        handle_agent_frame(&harness.state, &heartbeating, r#"{"type":"heartbeat"}"#).await;
        run_liveness_sweep(&harness.state).await;
    }

    for (id, ip, version) in [("nas", "10.0.0.2", "1.2.0"), ("db", "10.0.0.3", "0.9.1")] {
        let record = harness.state.presence.record(id).await;
        assert!(record.online, "{} should be online", id);
        assert_eq!(record.ip.as_deref(), Some(ip));
        assert_eq!(record.version.as_deref(), Some(version));
    }
}

#[tokio::test]
async fn test_oversized_tunnel_path_is_rejected() {
    let harness = Harness::new(vec![endpoint("nas", "alice")]);
    let connection = harness.agent("nas", |request| respond(&request, 200, &[], b"ok"));

    let uri = format!("/tunnel/nas/{}", "a".repeat(MAX_PATH_LENGTH + 1));
    let response = harness.send(session_get(&uri, "alice", &[])).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(error_message(response).await.starts_with("Path too long"));
    assert_eq!(connection.pending_count(), 0);
    assert!(harness.access_log.entries.lock().unwrap().is_empty());
}
