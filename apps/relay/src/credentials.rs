//! Agent authentication against stored relay keys
//!
//! Keys are never stored in clear: each credential keeps an Argon2id PHC hash plus the
//! first [`KEY_PREFIX_LEN`](webvpn_common::constants::KEY_PREFIX_LEN) characters, which
//! narrow a handshake down to a handful of candidates before any hash is checked.

use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use webvpn_common::constants::{CLOSE_INVALID_KEY, CLOSE_MISSING_KEY, CLOSE_SERVER_ERROR};
use webvpn_common::{RelayCredential, generate_relay_key, generate_request_id, key_prefix};

/// Storage of relay credentials
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Non-revoked credentials whose stored prefix equals `prefix`
    async fn find_active_by_prefix(&self, prefix: &str) -> Result<Vec<RelayCredential>>;

    async fn insert(&self, credential: RelayCredential) -> Result<()>;

    /// Revoke a credential of `tunnel_id`. Returns the credential, or None if unknown.
    async fn revoke(&self, tunnel_id: &str, credential_id: &str) -> Result<Option<RelayCredential>>;
}

/// Credentials kept in memory and, when a path is configured, mirrored to a JSON file
pub struct FileCredentialStore {
    path: Option<PathBuf>,
    credentials: RwLock<Vec<RelayCredential>>,
}

impl FileCredentialStore {
    pub fn in_memory(credentials: Vec<RelayCredential>) -> Self {
        Self {
            path: None,
            credentials: RwLock::new(credentials),
        }
    }

    /// Load credentials from `path`; a missing file starts empty
    pub async fn load(path: PathBuf) -> Result<Self> {
        let credentials = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Invalid credentials file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Credentials file {} not found, starting empty", path.display());
                Vec::new()
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read credentials file {}", path.display()));
            }
        };

        Ok(Self {
            path: Some(path),
            credentials: RwLock::new(credentials),
        })
    }

    async fn persist(&self, credentials: &[RelayCredential]) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let json = serde_json::to_vec_pretty(credentials)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn find_active_by_prefix(&self, prefix: &str) -> Result<Vec<RelayCredential>> {
        let credentials = self.credentials.read().await;
        Ok(credentials
            .iter()
            .filter(|c| !c.is_revoked() && c.key_prefix == prefix)
            .cloned()
            .collect())
    }

    async fn insert(&self, credential: RelayCredential) -> Result<()> {
        let mut credentials = self.credentials.write().await;
        credentials.push(credential);
        self.persist(&credentials).await
    }

    async fn revoke(&self, tunnel_id: &str, credential_id: &str) -> Result<Option<RelayCredential>> {
        let mut credentials = self.credentials.write().await;
        let Some(credential) = credentials
            .iter_mut()
            .find(|c| c.id == credential_id && c.tunnel_id == tunnel_id)
        else {
            return Ok(None);
        };

        credential.revoke(Utc::now());
        let revoked = credential.clone();
        self.persist(&credentials).await?;
        Ok(Some(revoked))
    }
}

/// Hash a relay key with Argon2id and a random salt
pub fn hash_key(key: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(key.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash key: {}", e))?;
    Ok(hash.to_string())
}

/// Check a relay key against a stored PHC hash. Malformed hashes never match.
pub fn verify_key(key: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(key.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!("Ignoring malformed credential hash: {}", e);
            false
        }
    }
}

/// A freshly generated key. The plaintext is only ever available here.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub key: String,
    pub credential: RelayCredential,
}

/// Generate a key for `tunnel_id` together with the credential to store
pub fn issue_key(tunnel_id: &str) -> Result<IssuedKey> {
    let key = generate_relay_key();
    let credential = RelayCredential {
        id: generate_request_id(),
        tunnel_id: tunnel_id.to_string(),
        key_prefix: key_prefix(&key).to_string(),
        key_hash: hash_key(&key)?,
        created_at: Utc::now(),
        revoked_at: None,
    };
    Ok(IssuedKey { key, credential })
}

/// Why an agent handshake was refused
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing key")]
    MissingKey,

    #[error("Invalid key")]
    InvalidKey,

    #[error("Credential store error: {0}")]
    Store(String),
}

impl AuthError {
    /// WebSocket close code sent to the agent
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::MissingKey => CLOSE_MISSING_KEY,
            AuthError::InvalidKey => CLOSE_INVALID_KEY,
            AuthError::Store(_) => CLOSE_SERVER_ERROR,
        }
    }

    /// Close reason sent to the agent; store details stay in the logs
    pub fn close_reason(&self) -> &'static str {
        match self {
            AuthError::MissingKey => "Missing key",
            AuthError::InvalidKey => "Invalid key",
            AuthError::Store(_) => "Server error",
        }
    }
}

/// Binds an agent credential to its tunnel identifier
#[derive(Clone)]
pub struct AgentAuthenticator {
    store: Arc<dyn CredentialStore>,
}

impl AgentAuthenticator {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Find the active credential matching `key`.
    ///
    /// Every candidate sharing the key's prefix is checked until one verifies; hash
    /// verification runs on the blocking pool.
    pub async fn authenticate(&self, key: Option<&str>) -> Result<RelayCredential, AuthError> {
        let key = key
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or(AuthError::MissingKey)?
            .to_string();

        let candidates = self
            .store
            .find_active_by_prefix(key_prefix(&key))
            .await
            .map_err(|e| AuthError::Store(format!("{:#}", e)))?;
        debug!(candidates = candidates.len(), "Verifying agent key");

        if candidates.is_empty() {
            return Err(AuthError::InvalidKey);
        }

        let matched = tokio::task::spawn_blocking(move || {
            candidates
                .into_iter()
                .find(|candidate| !candidate.is_revoked() && verify_key(&key, &candidate.key_hash))
        })
        .await
        .map_err(|e| AuthError::Store(e.to_string()))?;

        match matched {
            Some(credential) => {
                info!(tunnel_id = %credential.tunnel_id, credential_id = %credential.id, "Agent key accepted");
                Ok(credential)
            }
            None => Err(AuthError::InvalidKey),
        }
    }
}
