//! Wire shapes shared between the event channel, the coordinator, and the
//! webhook relay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One per-platform outcome notification from the synchronizer.
///
/// `status` is `"success"` on success; anything else counts as a failure
/// (the synchronizer reports `"error"` in practice).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub platform: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn succeeded(&self) -> bool {
        self.status == "success"
    }
}

/// Terminal per-job notification: which platforms ended up where. Received
/// from the synchronizer, or synthesized locally when the channel goes
/// silent or is lost.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub successful: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Everything the event channel can hand the coordinator. `Ping` is a
/// transport keepalive: it carries no payload but still counts as inbound
/// activity for the idle-timeout clock.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundEvent {
    Progress(ProgressEvent),
    Summary(Summary),
    Ping,
    /// Any event type this build does not know about. Tolerated so a new
    /// upstream event kind cannot kill an in-flight job.
    #[serde(other)]
    Unknown,
}
