//! WebVPN relay
//!
//! Accepts outbound WebSocket connections from agents running next to internal services,
//! and exposes those services to authenticated browsers under `{base}/tunnel/{id}/...`.
//! Requests are multiplexed over the agent connection by request id; HTML responses are
//! rewritten so applications built for the site root keep working under the prefix.

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{any, delete, get, post};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;
use webvpn_common::constants::MAX_BODY_SIZE_BYTES;

pub mod access;
pub mod auth;
pub mod config;
pub mod content_rewrite;
pub mod cookies;
pub mod credentials;
pub mod error_handling;
pub mod handlers;
pub mod interceptor;
pub mod presence;
pub mod registry;
pub mod relay;

use access::{AccessLogSink, EndpointStore, MemoryEndpointStore, TracingAccessLog};
use auth::SessionVerifier;
use config::RelayConfig;
use credentials::{AgentAuthenticator, FileCredentialStore};
use presence::{DynamoPresenceStore, MemoryPresenceStore, PresenceStore, PresenceTracker};
use registry::ConnectionRegistry;

/// Everything the handlers share
pub struct RelayState {
    pub config: RelayConfig,
    pub registry: ConnectionRegistry,
    pub presence: PresenceTracker,
    pub authenticator: AgentAuthenticator,
    pub sessions: SessionVerifier,
    pub endpoints: Arc<dyn EndpointStore>,
    pub access_log: Arc<dyn AccessLogSink>,
}

pub type AppState = Arc<RelayState>;

impl RelayState {
    pub fn new(
        config: RelayConfig,
        presence: Arc<dyn PresenceStore>,
        authenticator: AgentAuthenticator,
        endpoints: Arc<dyn EndpointStore>,
        access_log: Arc<dyn AccessLogSink>,
    ) -> Self {
        let sessions = SessionVerifier::new(config.session_secret.as_bytes());
        Self {
            config,
            registry: ConnectionRegistry::new(),
            presence: PresenceTracker::new(presence),
            authenticator,
            sessions,
            endpoints,
            access_log,
        }
    }

    /// Build the production state: file-backed endpoints and credentials, presence in
    /// DynamoDB when a table is configured and in memory otherwise
    pub async fn from_config(config: RelayConfig) -> Result<Self> {
        let endpoints = Arc::new(MemoryEndpointStore::load(&config.endpoints_file).await?);
        let credentials = Arc::new(FileCredentialStore::load(config.credentials_file.clone()).await?);

        let presence: Arc<dyn PresenceStore> = match &config.presence_table {
            Some(table) => {
                let aws_config = aws_config::load_from_env().await;
                info!("Using DynamoDB presence table {}", table);
                Arc::new(DynamoPresenceStore::new(
                    aws_sdk_dynamodb::Client::new(&aws_config),
                    table.clone(),
                ))
            }
            None => {
                info!("Using in-memory presence store");
                Arc::new(MemoryPresenceStore::new())
            }
        };

        Ok(Self::new(
            config,
            presence,
            AgentAuthenticator::new(credentials),
            endpoints,
            Arc::new(TracingAccessLog),
        ))
    }
}

/// All relay routes, mounted under the configured base path
pub fn build_router(state: AppState) -> Router {
    let routes = Router::new()
        .route("/ws", get(handlers::connect::agent_socket))
        .route("/ws/status", get(handlers::status::status_socket))
        .route(
            "/webvpn-api/clients/status",
            get(handlers::status::status_snapshot),
        )
        .route("/webvpn-api/clients/{id}/keys", post(handlers::keys::issue_key))
        .route(
            "/webvpn-api/clients/{id}/keys/{key_id}",
            delete(handlers::keys::revoke_key),
        )
        .route(
            interceptor::SERVICE_WORKER_PATH,
            get(handlers::assets::service_worker),
        )
        .route("/tunnel/{id}", any(handlers::forwarding::proxy_tunnel))
        .route("/tunnel/{id}/", any(handlers::forwarding::proxy_tunnel))
        .route("/tunnel/{id}/{*rest}", any(handlers::forwarding::proxy_tunnel));

    let router = if state.config.base_path.is_empty() {
        routes
    } else {
        Router::new().nest(&state.config.base_path, routes)
    };

    router
        .fallback(handlers::fallback::stray_request)
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
