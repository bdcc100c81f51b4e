//! Best-effort webhook relay.
//!
//! Every progress and summary event is forwarded once to a configured
//! observer endpoint. Delivery failures are logged and swallowed by the
//! caller; the relay is an observability side-channel and must never affect
//! a job's outcome. When no URL/secret is configured the relay degrades to
//! a logged no-op.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use crate::models::Summary;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("webhook delivery failed: {0}")]
    Delivery(#[from] reqwest::Error),
    #[error("webhook endpoint answered {0}")]
    Rejected(u16),
}

/// Relay seam for the coordinator; tests substitute recording or failing
/// sinks.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn relay_progress(
        &self,
        post_id: i64,
        platform: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), RelayError>;

    async fn relay_summary(&self, post_id: i64, summary: &Summary) -> Result<(), RelayError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProgressNotification<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    post_id: i64,
    platform: &'a str,
    status: &'static str,
    error: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SummaryNotification<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    post_id: i64,
    status: &'static str,
    summary: &'a Summary,
}

#[derive(Clone)]
pub struct WebhookRelay {
    http: Client,
    url: Option<String>,
    secret: Option<String>,
}

impl WebhookRelay {
    pub fn new(http: Client, url: Option<String>, secret: Option<String>) -> Self {
        Self { http, url, secret }
    }

    /// Returns the configured (url, secret) pair, or None when the relay
    /// should no-op.
    fn target(&self) -> Option<(&str, &str)> {
        match (self.url.as_deref(), self.secret.as_deref()) {
            (Some(url), Some(secret)) if !url.is_empty() && !secret.is_empty() => {
                Some((url, secret))
            }
            _ => None,
        }
    }

    async fn deliver<T: Serialize + Sync>(&self, post_id: i64, body: &T) -> Result<(), RelayError> {
        let Some((url, secret)) = self.target() else {
            tracing::warn!(post_id, "webhook url/secret not configured; notification dropped");
            return Ok(());
        };

        let resp = self
            .http
            .post(url)
            .header("X-Webhook-Secret", secret)
            .json(body)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(RelayError::Rejected(resp.status().as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookSink for WebhookRelay {
    async fn relay_progress(
        &self,
        post_id: i64,
        platform: &str,
        success: bool,
        error: Option<&str>,
    ) -> Result<(), RelayError> {
        let body = ProgressNotification {
            kind: "progress",
            post_id,
            platform,
            status: if success { "success" } else { "failed" },
            error,
        };
        tracing::info!(post_id, platform, "relaying progress notification");
        self.deliver(post_id, &body).await
    }

    async fn relay_summary(&self, post_id: i64, summary: &Summary) -> Result<(), RelayError> {
        let body = SummaryNotification {
            kind: "summary",
            post_id,
            status: "completed",
            summary,
        };
        tracing::info!(post_id, "relaying summary notification");
        self.deliver(post_id, &body).await
    }
}
