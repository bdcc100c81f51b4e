//! Credential manager for the synchronizer.
//!
//! One bearer token is cached in a JSON file shared by every worker process.
//! Fresh tokens are reused, tokens inside the one-hour refresh window are
//! renewed with the still-valid token, and anything else falls back to a
//! full login. Cache writes are atomic (temp file + rename) so a concurrent
//! reader never observes a torn file; a racing writer replacing the token a
//! moment later is fine, since the one we return is still valid.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::path::{Path, PathBuf};

use super::synchronizer::{SynchronizerClient, SynchronizerError, TokenGrant};

/// How long before expiry a token becomes refresh-eligible.
const REFRESH_WINDOW_HOURS: i64 = 1;
/// Validity assigned to a refreshed token.
const REFRESHED_TTL_HOURS: i64 = 24;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("synchronizer login failed: {0}")]
    Login(#[source] SynchronizerError),
    #[error("failed to persist token cache: {0}")]
    Cache(#[from] std::io::Error),
}

/// Token seam for the coordinator; tests substitute a fixed token.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn get_token(&self) -> Result<String, CredentialError>;
}

pub struct CredentialManager {
    client: SynchronizerClient,
    username: String,
    password: String,
    access_key: String,
    cache_path: PathBuf,
}

impl CredentialManager {
    pub fn new(
        client: SynchronizerClient,
        username: &str,
        password: &str,
        access_key: &str,
        cache_path: &Path,
    ) -> Self {
        Self {
            client,
            username: username.to_string(),
            password: password.to_string(),
            access_key: access_key.to_string(),
            cache_path: cache_path.to_path_buf(),
        }
    }

    async fn read_cache(&self) -> Option<TokenGrant> {
        let content = match tokio::fs::read_to_string(&self.cache_path).await {
            Ok(content) => content,
            Err(_) => return None,
        };
        match serde_json::from_str(&content) {
            Ok(grant) => Some(grant),
            Err(e) => {
                tracing::warn!("ignoring unreadable token cache: {}", e);
                None
            }
        }
    }

    /// Whole-file atomic replace: write a sibling temp file, then rename it
    /// over the cache path.
    async fn write_cache(&self, grant: &TokenGrant) -> Result<(), std::io::Error> {
        if let Some(dir) = self.cache_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let tmp_path = self.cache_path.with_extension("tmp");
        let body = serde_json::to_string(grant).map_err(std::io::Error::other)?;
        tokio::fs::write(&tmp_path, body).await?;
        tokio::fs::rename(&tmp_path, &self.cache_path).await?;
        Ok(())
    }

    async fn login(&self) -> Result<String, CredentialError> {
        let grant = self
            .client
            .login(&self.username, &self.password, &self.access_key)
            .await
            .map_err(CredentialError::Login)?;
        self.write_cache(&grant).await?;
        tracing::info!("synchronizer login succeeded");
        Ok(grant.token)
    }
}

#[async_trait]
impl TokenSource for CredentialManager {
    async fn get_token(&self) -> Result<String, CredentialError> {
        if let Some(cached) = self.read_cache().await {
            let now = Utc::now();
            let refresh_threshold = cached.expires_at - Duration::hours(REFRESH_WINDOW_HOURS);

            if now < refresh_threshold {
                tracing::debug!("using cached synchronizer token");
                return Ok(cached.token);
            }

            if now < cached.expires_at {
                tracing::info!("synchronizer token near expiry; attempting refresh");
                match self.client.refresh(&cached.token, &self.access_key).await {
                    Ok(token) => {
                        let grant = TokenGrant {
                            token: token.clone(),
                            expires_at: Utc::now() + Duration::hours(REFRESHED_TTL_HOURS),
                        };
                        self.write_cache(&grant).await?;
                        tracing::info!("synchronizer token refreshed");
                        return Ok(token);
                    }
                    Err(e) => {
                        tracing::warn!("token refresh failed ({}); falling back to login", e);
                    }
                }
            } else {
                tracing::info!("cached synchronizer token expired; logging in again");
            }
        } else {
            tracing::info!("no cached synchronizer token; logging in");
        }

        self.login().await
    }
}
