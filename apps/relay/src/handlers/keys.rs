//! Relay key management
//!
//! Keys are shown in clear exactly once, in the response that issues them.

use anyhow::Context;
use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use webvpn_common::EndpointConfig;

use crate::AppState;
use crate::access::may_manage;
use crate::auth::CallerIdentity;
use crate::credentials::issue_key as generate_credential;
use crate::error_handling::GatewayError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedKeyResponse {
    pub id: String,
    pub key: String,
    pub key_prefix: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokedKeyResponse {
    pub id: String,
    pub revoked_at: Option<DateTime<Utc>>,
}

async fn managed_endpoint(
    state: &AppState,
    headers: &HeaderMap,
    tunnel_id: &str,
) -> Result<(CallerIdentity, EndpointConfig), GatewayError> {
    let caller = state
        .sessions
        .authenticate(headers)
        .ok_or(GatewayError::Unauthenticated {
            login_redirect: None,
        })?;
    let endpoint = state
        .endpoints
        .get(tunnel_id)
        .await?
        .ok_or(GatewayError::EndpointNotFound)?;
    if !may_manage(&caller, &endpoint) {
        return Err(GatewayError::Forbidden);
    }
    Ok((caller, endpoint))
}

/// `POST {base}/webvpn-api/clients/{id}/keys`
pub async fn issue_key(
    State(state): State<AppState>,
    Path(tunnel_id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<IssuedKeyResponse>), GatewayError> {
    let (caller, endpoint) = managed_endpoint(&state, &headers, &tunnel_id).await?;

    let id = endpoint.id.clone();
    let issued = tokio::task::spawn_blocking(move || generate_credential(&id))
        .await
        .context("Key generation task failed")??;
    let credential = issued.credential;
    state.authenticator.store().insert(credential.clone()).await?;

    info!(
        tunnel_id = %endpoint.id,
        credential_id = %credential.id,
        user_id = %caller.user_id,
        "Issued relay key"
    );
    Ok((
        StatusCode::CREATED,
        Json(IssuedKeyResponse {
            id: credential.id,
            key: issued.key,
            key_prefix: credential.key_prefix,
            created_at: credential.created_at,
        }),
    ))
}

/// `DELETE {base}/webvpn-api/clients/{id}/keys/{key_id}`
pub async fn revoke_key(
    State(state): State<AppState>,
    Path((tunnel_id, key_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<RevokedKeyResponse>, GatewayError> {
    let (caller, endpoint) = managed_endpoint(&state, &headers, &tunnel_id).await?;

    let revoked = state
        .authenticator
        .store()
        .revoke(&endpoint.id, &key_id)
        .await?
        .ok_or(GatewayError::NotFound)?;

    info!(
        tunnel_id = %endpoint.id,
        credential_id = %revoked.id,
        user_id = %caller.user_id,
        "Revoked relay key"
    );
    Ok(Json(RevokedKeyResponse {
        id: revoked.id,
        revoked_at: revoked.revoked_at,
    }))
}
