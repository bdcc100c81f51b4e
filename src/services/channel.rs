//! Event channel client for the synchronizer.
//!
//! The channel is a server-side session polled over HTTP: a handshake
//! creates the session and returns its id in the response body, after which
//! short-deadline long-polls pull one inbound event at a time. The session
//! id is read straight from the documented handshake JSON; nothing is dug
//! out of client-library internals.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::models::InboundEvent;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("channel handshake failed: {0}")]
    Handshake(String),
    #[error("channel closed by server (status {0})")]
    Closed(u16),
    #[error("channel is disconnected")]
    Disconnected,
}

/// A live event channel, exclusively owned by one publish job.
#[async_trait]
pub trait EventChannel: Send {
    /// Server-assigned session id from the handshake.
    fn session_id(&self) -> &str;

    fn connected(&self) -> bool;

    /// Poll for the next inbound event, waiting at most `deadline`.
    /// `Ok(None)` means the poll elapsed with no data, which is not an
    /// error; the caller interleaves its own timeout bookkeeping.
    async fn next_event(&mut self, deadline: Duration)
    -> Result<Option<InboundEvent>, ChannelError>;

    /// Push an application envelope to the server over the channel.
    async fn send(&mut self, envelope: &serde_json::Value) -> Result<(), ChannelError>;

    /// Tear the session down. Best effort; the channel is considered
    /// disconnected afterwards regardless of what the server said.
    async fn disconnect(&mut self);
}

/// Factory seam so the coordinator can be tested with scripted channels.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn EventChannel>, ChannelError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeResponse {
    session_id: String,
}

pub struct HttpEventChannel {
    base_url: String,
    http: Client,
    session_id: String,
    connected: bool,
}

impl HttpEventChannel {
    pub async fn connect(base_url: &str, http: Client) -> Result<Self, ChannelError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let resp = http
            .post(format!("{}/events/session", base_url))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ChannelError::Handshake(format!("status {status}: {body}")));
        }

        let handshake: HandshakeResponse = resp
            .json()
            .await
            .map_err(|e| ChannelError::Handshake(format!("undecodable handshake body: {e}")))?;

        tracing::info!(session_id = %handshake.session_id, "event channel connected");

        Ok(Self {
            base_url,
            http,
            session_id: handshake.session_id,
            connected: true,
        })
    }
}

#[async_trait]
impl EventChannel for HttpEventChannel {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn connected(&self) -> bool {
        self.connected
    }

    async fn next_event(
        &mut self,
        deadline: Duration,
    ) -> Result<Option<InboundEvent>, ChannelError> {
        if !self.connected {
            return Err(ChannelError::Disconnected);
        }

        let result = self
            .http
            .get(format!(
                "{}/events/session/{}",
                self.base_url, self.session_id
            ))
            .query(&[("wait_ms", deadline.as_millis().to_string())])
            // Give the server its full poll window plus transit slack
            .timeout(deadline + Duration::from_secs(5))
            .send()
            .await;

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                self.connected = false;
                return Err(ChannelError::Transport(e));
            }
        };

        match resp.status() {
            StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let event: InboundEvent = resp.json().await.map_err(|e| {
                    tracing::error!("undecodable channel event: {}", e);
                    ChannelError::Transport(e)
                })?;
                Ok(Some(event))
            }
            status => {
                self.connected = false;
                Err(ChannelError::Closed(status.as_u16()))
            }
        }
    }

    async fn send(&mut self, envelope: &serde_json::Value) -> Result<(), ChannelError> {
        if !self.connected {
            return Err(ChannelError::Disconnected);
        }

        let resp = self
            .http
            .post(format!(
                "{}/events/session/{}",
                self.base_url, self.session_id
            ))
            .json(envelope)
            .send()
            .await
            .inspect_err(|_| self.connected = false)?;

        if !resp.status().is_success() {
            return Err(ChannelError::Closed(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        let result = self
            .http
            .delete(format!(
                "{}/events/session/{}",
                self.base_url, self.session_id
            ))
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!("event channel teardown failed (ignored): {}", e);
        }
    }
}

pub struct HttpChannelConnector {
    base_url: String,
    http: Client,
}

impl HttpChannelConnector {
    pub fn new(base_url: &str, http: Client) -> Self {
        Self {
            base_url: base_url.to_string(),
            http,
        }
    }
}

#[async_trait]
impl ChannelConnector for HttpChannelConnector {
    async fn connect(&self) -> Result<Box<dyn EventChannel>, ChannelError> {
        let channel = HttpEventChannel::connect(&self.base_url, self.http.clone()).await?;
        Ok(Box::new(channel))
    }
}
