//! HTTP client for the external publishing service ("the synchronizer").
//!
//! Four calls: login and token refresh (used by the credential manager),
//! batch job submission (companion request path of the event channel), and
//! the synchronous single-platform post.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::images::PreparedImage;

#[derive(Debug, thiserror::Error)]
pub enum SynchronizerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("synchronizer API error: {0}")]
    Api(String),
}

/// A freshly issued bearer token with its absolute expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshResponse {
    access_token: String,
}

/// Batch job envelope for `/publish-all/post`. The `session_id` ties the
/// submission to the event channel the caller is already listening on.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub platforms: Vec<String>,
    pub instance_id: String,
    pub post_id: String,
    pub text: Option<String>,
    pub images: Vec<PreparedImage>,
    pub tags: Vec<String>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_options: Option<serde_json::Value>,
}

/// Single-platform job envelope for `/{platform}/post`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleJob {
    pub instance_id: String,
    pub post_id: String,
    pub text: Option<String>,
    pub tags: Vec<String>,
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blog_name: Option<String>,
}

/// Upstream status and body of a single-platform post, passed through to the
/// caller unmodified.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: serde_json::Value,
}

impl UpstreamResponse {
    pub fn succeeded(&self) -> bool {
        self.status == 200 || self.status == 201
    }
}

/// Job submission seam for the coordinator; tests substitute a fake.
#[async_trait]
pub trait JobGateway: Send + Sync {
    /// Submit the batch job. `Ok(false)` means the synchronizer answered with
    /// something other than 202; the caller decides whether to keep waiting.
    async fn submit_batch(&self, token: &str, job: &BatchJob)
    -> Result<bool, SynchronizerError>;

    async fn post_single(
        &self,
        token: &str,
        platform: &str,
        job: &SingleJob,
    ) -> Result<UpstreamResponse, SynchronizerError>;
}

#[derive(Clone)]
pub struct SynchronizerClient {
    base_url: String,
    http: Client,
}

impl SynchronizerClient {
    pub fn new(base_url: &str, http: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// Full login with credentials plus the static access key. A 200 body
    /// carries both the token and its expiry.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        access_key: &str,
    ) -> Result<TokenGrant, SynchronizerError> {
        let resp = self
            .http
            .post(format!("{}/auth/login", self.base_url))
            .json(&serde_json::json!({
                "username": username,
                "password": password,
                "accessToken": access_key,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(SynchronizerError::Api(text));
        }

        let grant: TokenGrant = resp.json().await?;
        Ok(grant)
    }

    /// Renew a still-valid token. Returns only the new token string; the
    /// caller assigns the new expiry window.
    pub async fn refresh(
        &self,
        current_token: &str,
        access_key: &str,
    ) -> Result<String, SynchronizerError> {
        let resp = self
            .http
            .post(format!("{}/auth/token/refresh", self.base_url))
            .header("Authorization", format!("Bearer {}", current_token))
            .json(&serde_json::json!({ "accessToken": access_key }))
            .send()
            .await?;

        if !resp.status().is_success() {
            let text = resp.text().await?;
            return Err(SynchronizerError::Api(text));
        }

        let refreshed: RefreshResponse = resp.json().await?;
        Ok(refreshed.access_token)
    }
}

#[async_trait]
impl JobGateway for SynchronizerClient {
    async fn submit_batch(
        &self,
        token: &str,
        job: &BatchJob,
    ) -> Result<bool, SynchronizerError> {
        let resp = self
            .http
            .post(format!("{}/publish-all/post", self.base_url))
            .header("Authorization", format!("Bearer {}", token))
            .json(job)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() != 202 {
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(
                status = status.as_u16(),
                body,
                "synchronizer did not accept the batch job"
            );
            return Ok(false);
        }

        tracing::info!("batch job accepted (202); awaiting channel events");
        Ok(true)
    }

    async fn post_single(
        &self,
        token: &str,
        platform: &str,
        job: &SingleJob,
    ) -> Result<UpstreamResponse, SynchronizerError> {
        let resp = self
            .http
            .post(format!("{}/{}/post", self.base_url, platform))
            .header("Authorization", format!("Bearer {}", token))
            .json(job)
            .send()
            .await?;

        let status = resp.status().as_u16();
        let body = resp
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);

        Ok(UpstreamResponse { status, body })
    }
}
