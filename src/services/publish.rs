//! Publish job coordinator.
//!
//! `publish_all` fans a post out to several platforms through the
//! synchronizer: persist first, then authenticate, open the event channel,
//! submit the job, and reconcile the inbound progress stream into the send
//! ledger until a summary arrives or the idle budget runs out. The single
//! platform path (`publish_one`) is a plain request/response call with no
//! channel involved.

use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::domain::platforms::{self, Platform, canonical_name};
use crate::domain::posts::{self, PostRecord};
use crate::domain::sends::{self, SendLedger};
use crate::models::{InboundEvent, Summary};
use crate::services::channel::{ChannelConnector, ChannelError, EventChannel};
use crate::services::credentials::{CredentialError, TokenSource};
use crate::services::images::{self, ImageError, ImageInput};
use crate::services::synchronizer::{BatchJob, JobGateway, SingleJob, SynchronizerError, UpstreamResponse};
use crate::services::webhook::WebhookSink;

/// Maximum wall-clock gap without inbound channel activity before the
/// coordinator gives up and synthesizes its own summary.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Per-poll deadline; short so timeout checks interleave with receives.
const POLL_DEADLINE: Duration = Duration::from_millis(750);

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("{0}")]
    Validation(String),
    #[error("platform '{0}' not found")]
    UnknownPlatform(String),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Gateway(#[from] SynchronizerError),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("storage error: {0}")]
    Persistence(#[from] sqlx::Error),
}

/// How one batch job's receive loop ended. Start failures (credentials,
/// connect, submission transport) surface as `PublishError` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The synchronizer sent its terminal summary.
    Completed,
    /// The idle budget elapsed; a summary was synthesized locally.
    TimedOut,
    /// The channel errored or dropped mid-stream; a best-effort summary was
    /// synthesized so the webhook observer is not left silent.
    ChannelLost,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub post_id: i64,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone)]
pub struct SingleResult {
    pub post_id: i64,
    pub upstream: UpstreamResponse,
}

/// Caller-facing publish payload, shared by both endpoints (`platforms` is
/// ignored on the single-platform path).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishRequest {
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub schedule_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub images: Vec<ImageInput>,
    #[serde(default)]
    pub platform_options: Option<serde_json::Value>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

pub struct PublishService {
    db: PgPool,
    http: Client,
    tokens: Arc<dyn TokenSource>,
    gateway: Arc<dyn JobGateway>,
    connector: Arc<dyn ChannelConnector>,
    ledger: Arc<dyn SendLedger>,
    webhook: Arc<dyn WebhookSink>,
    access_key: String,
    idle_timeout: Duration,
    simulate: bool,
}

impl PublishService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: PgPool,
        http: Client,
        tokens: Arc<dyn TokenSource>,
        gateway: Arc<dyn JobGateway>,
        connector: Arc<dyn ChannelConnector>,
        ledger: Arc<dyn SendLedger>,
        webhook: Arc<dyn WebhookSink>,
        access_key: &str,
        simulate: bool,
    ) -> Self {
        Self {
            db,
            http,
            tokens,
            gateway,
            connector,
            ledger,
            webhook,
            access_key: access_key.to_string(),
            idle_timeout: IDLE_TIMEOUT,
            simulate,
        }
    }

    /// Fan one post out to every requested platform.
    pub async fn publish_all(&self, request: PublishRequest) -> Result<BatchResult, PublishError> {
        if request.platforms.is_empty() {
            return Err(PublishError::Validation(
                "the \"platforms\" field is required and must be a non-empty list".into(),
            ));
        }
        let platform_names = canonical_platform_list(&request.platforms);
        let platform_rows = self.lookup_platforms(&platform_names).await?;

        // Post and sends are persisted before any network call so a crash
        // from here on still leaves auditable state.
        let post = self.persist_post(&request, &platform_rows).await?;
        tracing::info!(post_id = post.id, "post saved; starting batch publish");

        if self.simulate {
            self.simulate_batch(post.id, &platform_names).await;
            return Ok(BatchResult {
                post_id: post.id,
                outcome: JobOutcome::Completed,
            });
        }

        let token = self.tokens.get_token().await?;

        let mut channel = self.connector.connect().await?;
        let drive_result = self
            .submit_and_drive(channel.as_mut(), &token, &post, &platform_names, &request)
            .await;
        // The channel is released on every path out of the loop
        channel.disconnect().await;
        let outcome = drive_result?;

        self.finalize_post_status(post.id, &platform_names).await;

        Ok(BatchResult {
            post_id: post.id,
            outcome,
        })
    }

    /// Synchronous single-platform publish: one HTTP call, its outcome
    /// recorded on the one send, upstream status passed through. At most
    /// one attempt, never retried.
    pub async fn publish_one(
        &self,
        platform: &str,
        request: PublishRequest,
    ) -> Result<SingleResult, PublishError> {
        let name = canonical_name(platform);
        let row = platforms::find_by_name(&self.db, &name)
            .await?
            .ok_or_else(|| PublishError::UnknownPlatform(name.clone()))?;
        if !row.active {
            return Err(PublishError::Validation(format!(
                "platform '{name}' is disabled"
            )));
        }

        let blog_name = extract_blog_name(&name, request.platform_options.as_ref())?;

        let post = self.persist_post(&request, std::slice::from_ref(&row)).await?;
        tracing::info!(post_id = post.id, platform = %name, "post saved; starting single publish");

        if self.simulate {
            let upstream = self.simulate_single(post.id, &name).await?;
            return Ok(SingleResult {
                post_id: post.id,
                upstream,
            });
        }

        let token = self.tokens.get_token().await?;

        let prepared = images::prepare_for_upload(&self.http, &request.images).await?;
        let job = SingleJob {
            instance_id: self.access_key.clone(),
            post_id: post.id.to_string(),
            text: post.text.clone(),
            tags: request.tags.clone(),
            images: prepared.into_iter().map(|i| i.base64).collect(),
            blog_name,
        };

        let dispatch = dispatch_single(
            self.gateway.as_ref(),
            self.ledger.as_ref(),
            &token,
            post.id,
            &name,
            &job,
        )
        .await;

        let succeeded = matches!(&dispatch, Ok(upstream) if upstream.succeeded());
        posts::update_status(&self.db, post.id, if succeeded { "SUCCESS" } else { "WARNING" })
            .await?;

        let upstream = dispatch?;
        tracing::info!(
            post_id = post.id,
            platform = %name,
            status = upstream.status,
            "single publish finished"
        );

        Ok(SingleResult {
            post_id: post.id,
            upstream,
        })
    }

    async fn lookup_platforms(&self, names: &[String]) -> Result<Vec<Platform>, PublishError> {
        let rows = platforms::find_by_names(&self.db, names).await?;
        for name in names {
            match rows.iter().find(|r| &r.name == name) {
                None => return Err(PublishError::UnknownPlatform(name.clone())),
                Some(row) if !row.active => {
                    return Err(PublishError::Validation(format!(
                        "platform '{name}' is disabled"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(rows)
    }

    async fn persist_post(
        &self,
        request: &PublishRequest,
        platform_rows: &[Platform],
    ) -> Result<PostRecord, PublishError> {
        let mut tx = self.db.begin().await?;

        let post = posts::create_post(
            &mut *tx,
            request.text.as_deref(),
            request.platform_options.as_ref(),
            request.callback_url.as_deref(),
            request.schedule_date,
        )
        .await?;

        for tag in &request.tags {
            posts::attach_tag(&mut *tx, post.id, tag).await?;
        }

        for image in &request.images {
            // Store whichever representation the caller provided
            if let Some(stored) = image.base64.as_deref().or(image.url.as_deref()) {
                posts::attach_image(&mut *tx, post.id, stored, image.platforms.as_deref()).await?;
            }
        }

        for row in platform_rows {
            sends::create_send(&mut *tx, post.id, row.id).await?;
        }

        tx.commit().await?;
        Ok(post)
    }

    async fn submit_and_drive(
        &self,
        channel: &mut dyn EventChannel,
        token: &str,
        post: &PostRecord,
        platform_names: &[String],
        request: &PublishRequest,
    ) -> Result<JobOutcome, PublishError> {
        let prepared = images::prepare_for_upload(&self.http, &request.images).await?;

        let job = BatchJob {
            platforms: platform_names.to_vec(),
            instance_id: self.access_key.clone(),
            post_id: post.id.to_string(),
            text: post.text.clone(),
            images: prepared,
            tags: request.tags.clone(),
            session_id: channel.session_id().to_string(),
            platform_options: request.platform_options.clone(),
        };

        // A non-202 answer is logged inside the gateway but we still wait:
        // the synchronizer may have accepted the job asynchronously.
        self.gateway.submit_batch(token, &job).await?;

        if let Err(e) = posts::update_status(&self.db, post.id, "SENT").await {
            tracing::error!(post_id = post.id, "failed to mark post as sent: {}", e);
        }

        Ok(drive_events(
            channel,
            self.ledger.as_ref(),
            self.webhook.as_ref(),
            post.id,
            platform_names,
            self.idle_timeout,
            POLL_DEADLINE,
        )
        .await)
    }

    /// Post status bookkeeping after the loop: SUCCESS when every send
    /// succeeded, WARNING otherwise. Failures here are logged only; the job
    /// outcome stands.
    async fn finalize_post_status(&self, post_id: i64, platform_names: &[String]) {
        let successful = match self.ledger.successful_among(post_id, platform_names).await {
            Ok(successful) => successful,
            Err(e) => {
                tracing::error!(post_id, "could not read sends for status rollup: {}", e);
                return;
            }
        };
        let status = if successful.len() == platform_names.len() {
            "SUCCESS"
        } else {
            "WARNING"
        };
        if let Err(e) = posts::update_status(&self.db, post_id, status).await {
            tracing::error!(post_id, "failed to update post status: {}", e);
        }
    }

    /// Walk the sends with randomized outcomes instead of calling the
    /// synchronizer. Lets a frontend integrate against the webhook without
    /// the external service.
    async fn simulate_batch(&self, post_id: i64, platform_names: &[String]) {
        tracing::info!(post_id, "simulating batch publish");
        let mut successful = Vec::new();
        let mut failed = Vec::new();

        for name in platform_names {
            let delay = rand::rng().random_range(1..=2);
            tokio::time::sleep(Duration::from_secs(delay)).await;

            let fails = rand::rng().random_bool(0.30);
            let error = fails.then(|| format!("simulated failure for {name}"));

            if let Err(e) = self
                .ledger
                .update(post_id, name, !fails, error.as_deref())
                .await
            {
                tracing::error!(post_id, platform = %name, "simulated send update failed: {}", e);
            }
            if let Err(e) = self
                .webhook
                .relay_progress(post_id, name, !fails, error.as_deref())
                .await
            {
                tracing::warn!(post_id, "webhook relay failed (ignored): {}", e);
            }

            if fails {
                failed.push(name.clone());
            } else {
                successful.push(name.clone());
            }
        }

        let summary = Summary {
            status: "completed".into(),
            completed_at: Some(Utc::now()),
            successful,
            failed,
            reason: None,
        };
        if let Err(e) = self.webhook.relay_summary(post_id, &summary).await {
            tracing::warn!(post_id, "webhook relay failed (ignored): {}", e);
        }

        self.finalize_post_status(post_id, platform_names).await;
    }

    async fn simulate_single(
        &self,
        post_id: i64,
        name: &str,
    ) -> Result<UpstreamResponse, PublishError> {
        let delay = rand::rng().random_range(1..=2);
        tokio::time::sleep(Duration::from_secs(delay)).await;

        let fails = rand::rng().random_bool(0.15);
        let error = fails.then(|| "simulated failure".to_string());

        self.ledger
            .update(post_id, name, !fails, error.as_deref())
            .await?;
        posts::update_status(&self.db, post_id, if fails { "WARNING" } else { "SUCCESS" })
            .await?;

        Ok(UpstreamResponse {
            status: if fails { 500 } else { 200 },
            body: match error {
                Some(error) => serde_json::json!({ "error": error }),
                None => serde_json::json!({ "message": "simulated success" }),
            },
        })
    }
}

/// One attempt against the synchronizer for a single-platform post. The
/// send records the outcome in every case, including a transport-level
/// dispatch failure, so the ledger is never left unresolved by this path.
async fn dispatch_single(
    gateway: &dyn JobGateway,
    ledger: &dyn SendLedger,
    token: &str,
    post_id: i64,
    platform: &str,
    job: &SingleJob,
) -> Result<UpstreamResponse, PublishError> {
    let upstream = match gateway.post_single(token, platform, job).await {
        Ok(upstream) => upstream,
        Err(e) => {
            let reason = e.to_string();
            if let Err(db_err) = ledger.update(post_id, platform, false, Some(&reason)).await {
                tracing::error!(
                    post_id,
                    platform,
                    "send update failed after dispatch error: {}",
                    db_err
                );
            }
            return Err(PublishError::Gateway(e));
        }
    };

    let success = upstream.succeeded();
    let error_text = (!success).then(|| upstream_error_text(&upstream));
    ledger
        .update(post_id, platform, success, error_text.as_deref())
        .await?;
    Ok(upstream)
}

/// The receive loop. Pulls inbound events with short poll deadlines so the
/// idle-timeout check interleaves; every genuine inbound event (including
/// keepalive pings) resets the idle clock, empty polls do not.
async fn drive_events(
    channel: &mut dyn EventChannel,
    ledger: &dyn SendLedger,
    webhook: &dyn WebhookSink,
    post_id: i64,
    requested: &[String],
    idle_timeout: Duration,
    poll_deadline: Duration,
) -> JobOutcome {
    let mut seen: HashSet<String> = HashSet::new();
    let mut last_activity = Instant::now();

    loop {
        if last_activity.elapsed() >= idle_timeout {
            tracing::warn!(post_id, "idle timeout reached; synthesizing summary");
            let summary =
                synthesize_summary(ledger, post_id, requested, &seen, "timeout").await;
            if let Err(e) = webhook.relay_summary(post_id, &summary).await {
                tracing::warn!(post_id, "webhook relay failed (ignored): {}", e);
            }
            return JobOutcome::TimedOut;
        }

        match channel.next_event(poll_deadline).await {
            Ok(Some(event)) => {
                last_activity = Instant::now();
                match event {
                    InboundEvent::Progress(progress) => {
                        let name = canonical_name(&progress.platform);
                        let success = progress.succeeded();
                        tracing::info!(post_id, platform = %name, success, "progress event");

                        // A failed row update leaves that send unresolved
                        // rather than aborting the whole job
                        if let Err(e) = ledger
                            .update(post_id, &name, success, progress.error.as_deref())
                            .await
                        {
                            tracing::error!(
                                post_id,
                                platform = %name,
                                "send update failed; leaving unresolved: {}",
                                e
                            );
                        }
                        seen.insert(name.clone());

                        if let Err(e) = webhook
                            .relay_progress(post_id, &name, success, progress.error.as_deref())
                            .await
                        {
                            tracing::warn!(post_id, "webhook relay failed (ignored): {}", e);
                        }
                    }
                    InboundEvent::Summary(summary) => {
                        tracing::info!(post_id, "summary event received; job complete");
                        if let Err(e) = webhook.relay_summary(post_id, &summary).await {
                            tracing::warn!(post_id, "webhook relay failed (ignored): {}", e);
                        }
                        return JobOutcome::Completed;
                    }
                    InboundEvent::Ping => {
                        tracing::debug!(post_id, "channel keepalive");
                    }
                    InboundEvent::Unknown => {
                        tracing::debug!(post_id, "unrecognized channel event type; ignoring");
                    }
                }
            }
            Ok(None) => {
                // Empty poll: no data, no idle-clock reset
            }
            Err(e) => {
                tracing::error!(post_id, "event channel lost: {}", e);
                let summary =
                    synthesize_summary(ledger, post_id, requested, &seen, "connection_lost").await;
                if let Err(e) = webhook.relay_summary(post_id, &summary).await {
                    tracing::warn!(post_id, "webhook relay failed (ignored): {}", e);
                }
                return JobOutcome::ChannelLost;
            }
        }
    }
}

/// Build the local stand-in for a summary the synchronizer never sent:
/// successful = platforms seen with a successful send, failed = everything
/// else that was requested.
async fn synthesize_summary(
    ledger: &dyn SendLedger,
    post_id: i64,
    requested: &[String],
    seen: &HashSet<String>,
    reason: &str,
) -> Summary {
    let seen_names: Vec<String> = seen.iter().cloned().collect();
    let successful = if seen_names.is_empty() {
        Vec::new()
    } else {
        match ledger.successful_among(post_id, &seen_names).await {
            Ok(successful) => successful,
            Err(e) => {
                tracing::error!(post_id, "could not read sends for summary synthesis: {}", e);
                Vec::new()
            }
        }
    };

    let failed: Vec<String> = requested
        .iter()
        .filter(|name| !successful.contains(name))
        .cloned()
        .collect();

    Summary {
        status: "completed_with_timeout".into(),
        completed_at: Some(Utc::now()),
        successful,
        failed,
        reason: Some(reason.to_string()),
    }
}

/// Canonicalize and de-duplicate the requested platform names, preserving
/// the caller's order.
fn canonical_platform_list(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let canon = canonical_name(name);
        if !out.contains(&canon) {
            out.push(canon);
        }
    }
    out
}

/// Tumblr posts need a target blog; anything else passes through.
fn extract_blog_name(
    platform: &str,
    options: Option<&serde_json::Value>,
) -> Result<Option<String>, PublishError> {
    if platform != "tumblr" {
        return Ok(None);
    }
    let blog_name = options
        .and_then(|o| o.get("tumblr"))
        .and_then(|t| t.get("blogName"))
        .and_then(|b| b.as_str())
        .filter(|b| !b.is_empty());
    match blog_name {
        Some(blog_name) => Ok(Some(blog_name.to_string())),
        None => Err(PublishError::Validation(
            "'blogName' is required to post to tumblr".into(),
        )),
    }
}

fn upstream_error_text(upstream: &UpstreamResponse) -> String {
    upstream
        .body
        .get("error")
        .and_then(|e| e.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("external API error (status {})", upstream.status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::sends::SendView;
    use crate::models::ProgressEvent;
    use crate::services::webhook::RelayError;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // A channel that replays a script: events arrive instantly, silences
    // advance (paused) time, and Fail drops the connection.
    enum Step {
        Event(InboundEvent),
        Silence(Duration),
        Fail,
    }

    struct ScriptedChannel {
        script: Mutex<VecDeque<Step>>,
        connected: bool,
    }

    impl ScriptedChannel {
        fn new(script: Vec<Step>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                connected: true,
            }
        }
    }

    #[async_trait]
    impl EventChannel for ScriptedChannel {
        fn session_id(&self) -> &str {
            "sid-test"
        }

        fn connected(&self) -> bool {
            self.connected
        }

        async fn next_event(
            &mut self,
            deadline: Duration,
        ) -> Result<Option<InboundEvent>, ChannelError> {
            let step = self.script.lock().unwrap().pop_front();
            match step {
                Some(Step::Event(event)) => Ok(Some(event)),
                Some(Step::Silence(duration)) => {
                    tokio::time::sleep(duration).await;
                    Ok(None)
                }
                Some(Step::Fail) => {
                    self.connected = false;
                    Err(ChannelError::Closed(410))
                }
                None => {
                    tokio::time::sleep(deadline).await;
                    Ok(None)
                }
            }
        }

        async fn send(&mut self, _envelope: &serde_json::Value) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn disconnect(&mut self) {
            self.connected = false;
        }
    }

    #[derive(Default)]
    struct FakeLedger {
        rows: Mutex<HashMap<String, (Option<bool>, Option<String>)>>,
    }

    impl FakeLedger {
        fn with_platforms(names: &[&str]) -> Self {
            let ledger = Self::default();
            {
                let mut rows = ledger.rows.lock().unwrap();
                for name in names {
                    rows.insert(name.to_string(), (None, None));
                }
            }
            ledger
        }

        fn row(&self, name: &str) -> (Option<bool>, Option<String>) {
            self.rows.lock().unwrap().get(name).cloned().unwrap_or((None, None))
        }
    }

    #[async_trait]
    impl SendLedger for FakeLedger {
        async fn find(
            &self,
            post_id: i64,
            platform: &str,
        ) -> Result<Option<SendView>, sqlx::Error> {
            Ok(self.rows.lock().unwrap().get(platform).map(|(success, error)| SendView {
                post_id,
                platform: platform.to_string(),
                success: *success,
                error: error.clone(),
                updated_at: Utc::now(),
            }))
        }

        async fn update(
            &self,
            _post_id: i64,
            platform: &str,
            success: bool,
            error: Option<&str>,
        ) -> Result<(), sqlx::Error> {
            self.rows
                .lock()
                .unwrap()
                .insert(platform.to_string(), (Some(success), error.map(String::from)));
            Ok(())
        }

        async fn successful_among(
            &self,
            _post_id: i64,
            names: &[String],
        ) -> Result<Vec<String>, sqlx::Error> {
            let rows = self.rows.lock().unwrap();
            Ok(names
                .iter()
                .filter(|name| matches!(rows.get(*name), Some((Some(true), _))))
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        fail: bool,
        progress: Mutex<Vec<(String, bool)>>,
        summaries: Mutex<Vec<Summary>>,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl WebhookSink for RecordingSink {
        async fn relay_progress(
            &self,
            _post_id: i64,
            platform: &str,
            success: bool,
            _error: Option<&str>,
        ) -> Result<(), RelayError> {
            self.progress
                .lock()
                .unwrap()
                .push((platform.to_string(), success));
            if self.fail {
                return Err(RelayError::Rejected(500));
            }
            Ok(())
        }

        async fn relay_summary(&self, _post_id: i64, summary: &Summary) -> Result<(), RelayError> {
            self.summaries.lock().unwrap().push(summary.clone());
            if self.fail {
                return Err(RelayError::Rejected(500));
            }
            Ok(())
        }
    }

    fn progress(platform: &str, status: &str, error: Option<&str>) -> Step {
        Step::Event(InboundEvent::Progress(ProgressEvent {
            platform: platform.into(),
            status: status.into(),
            error: error.map(String::from),
        }))
    }

    fn summary(successful: &[&str], failed: &[&str]) -> Step {
        Step::Event(InboundEvent::Summary(Summary {
            status: "completed".into(),
            completed_at: Some(Utc::now()),
            successful: successful.iter().map(|s| s.to_string()).collect(),
            failed: failed.iter().map(|s| s.to_string()).collect(),
            reason: None,
        }))
    }

    fn requested(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn summary_before_timeout_completes_the_job() {
        let mut channel = ScriptedChannel::new(vec![
            progress("tumblr", "success", None),
            progress("bluesky", "error", Some("handle not found")),
            summary(&["tumblr"], &["bluesky"]),
        ]);
        let ledger = FakeLedger::with_platforms(&["tumblr", "bluesky"]);
        let sink = RecordingSink::default();

        let outcome = drive_events(
            &mut channel,
            &ledger,
            &sink,
            7,
            &requested(&["tumblr", "bluesky"]),
            IDLE_TIMEOUT,
            POLL_DEADLINE,
        )
        .await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(ledger.row("tumblr"), (Some(true), None));
        let (bluesky_success, bluesky_error) = ledger.row("bluesky");
        assert_eq!(bluesky_success, Some(false));
        assert!(bluesky_error.is_some());

        assert_eq!(
            *sink.progress.lock().unwrap(),
            vec![("tumblr".to_string(), true), ("bluesky".to_string(), false)]
        );
        assert_eq!(sink.summaries.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn total_silence_times_out_with_synthesized_summary() {
        let mut channel = ScriptedChannel::new(vec![]);
        let ledger = FakeLedger::with_platforms(&["threads"]);
        let sink = RecordingSink::default();

        let outcome = drive_events(
            &mut channel,
            &ledger,
            &sink,
            7,
            &requested(&["threads"]),
            IDLE_TIMEOUT,
            POLL_DEADLINE,
        )
        .await;

        assert_eq!(outcome, JobOutcome::TimedOut);
        let summaries = sink.summaries.lock().unwrap();
        assert_eq!(summaries.len(), 1);
        assert!(summaries[0].successful.is_empty());
        assert_eq!(summaries[0].failed, vec!["threads".to_string()]);
        assert_eq!(summaries[0].reason.as_deref(), Some("timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_success_is_preserved_through_a_timeout() {
        let mut channel = ScriptedChannel::new(vec![progress("tumblr", "success", None)]);
        let ledger = FakeLedger::with_platforms(&["tumblr", "bluesky", "threads"]);
        let sink = RecordingSink::default();

        let outcome = drive_events(
            &mut channel,
            &ledger,
            &sink,
            7,
            &requested(&["tumblr", "bluesky", "threads"]),
            IDLE_TIMEOUT,
            POLL_DEADLINE,
        )
        .await;

        assert_eq!(outcome, JobOutcome::TimedOut);
        // The send that reported success before the timeout keeps it
        assert_eq!(ledger.row("tumblr"), (Some(true), None));
        let summaries = sink.summaries.lock().unwrap();
        assert_eq!(summaries[0].successful, vec!["tumblr".to_string()]);
        assert_eq!(
            summaries[0].failed,
            vec!["bluesky".to_string(), "threads".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn relay_failures_never_change_the_outcome() {
        let mut channel = ScriptedChannel::new(vec![
            progress("tumblr", "success", None),
            summary(&["tumblr"], &[]),
        ]);
        let ledger = FakeLedger::with_platforms(&["tumblr"]);
        let sink = RecordingSink::failing();

        let outcome = drive_events(
            &mut channel,
            &ledger,
            &sink,
            7,
            &requested(&["tumblr"]),
            IDLE_TIMEOUT,
            POLL_DEADLINE,
        )
        .await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(ledger.row("tumblr"), (Some(true), None));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_loss_synthesizes_a_best_effort_summary() {
        let mut channel = ScriptedChannel::new(vec![
            progress("tumblr", "success", None),
            Step::Fail,
        ]);
        let ledger = FakeLedger::with_platforms(&["tumblr", "bluesky"]);
        let sink = RecordingSink::default();

        let outcome = drive_events(
            &mut channel,
            &ledger,
            &sink,
            7,
            &requested(&["tumblr", "bluesky"]),
            IDLE_TIMEOUT,
            POLL_DEADLINE,
        )
        .await;

        assert_eq!(outcome, JobOutcome::ChannelLost);
        let summaries = sink.summaries.lock().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].reason.as_deref(), Some("connection_lost"));
        assert_eq!(summaries[0].successful, vec!["tumblr".to_string()]);
        assert_eq!(summaries[0].failed, vec!["bluesky".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn last_terminal_event_wins_per_platform() {
        let mut channel = ScriptedChannel::new(vec![
            progress("tumblr", "error", Some("transient")),
            progress("tumblr", "success", None),
            summary(&["tumblr"], &[]),
        ]);
        let ledger = FakeLedger::with_platforms(&["tumblr"]);
        let sink = RecordingSink::default();

        let outcome = drive_events(
            &mut channel,
            &ledger,
            &sink,
            7,
            &requested(&["tumblr"]),
            IDLE_TIMEOUT,
            POLL_DEADLINE,
        )
        .await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(ledger.row("tumblr"), (Some(true), None));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_pings_reset_the_idle_clock() {
        // 10 minutes of silence, a ping, 10 more minutes, then real events:
        // 20 minutes total but no idle gap ever reaches 15
        let mut channel = ScriptedChannel::new(vec![
            Step::Silence(Duration::from_secs(10 * 60)),
            Step::Event(InboundEvent::Ping),
            Step::Silence(Duration::from_secs(10 * 60)),
            progress("tumblr", "success", None),
            summary(&["tumblr"], &[]),
        ]);
        let ledger = FakeLedger::with_platforms(&["tumblr"]);
        let sink = RecordingSink::default();

        let outcome = drive_events(
            &mut channel,
            &ledger,
            &sink,
            7,
            &requested(&["tumblr"]),
            IDLE_TIMEOUT,
            POLL_DEADLINE,
        )
        .await;

        assert_eq!(outcome, JobOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_progress_platform_names_are_canonicalized() {
        let mut channel = ScriptedChannel::new(vec![
            progress("X", "success", None),
            summary(&["twitter"], &[]),
        ]);
        let ledger = FakeLedger::with_platforms(&["twitter"]);
        let sink = RecordingSink::default();

        let outcome = drive_events(
            &mut channel,
            &ledger,
            &sink,
            7,
            &requested(&["twitter"]),
            IDLE_TIMEOUT,
            POLL_DEADLINE,
        )
        .await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(ledger.row("twitter"), (Some(true), None));
    }

    struct FailingGateway;

    #[async_trait]
    impl JobGateway for FailingGateway {
        async fn submit_batch(
            &self,
            _token: &str,
            _job: &BatchJob,
        ) -> Result<bool, SynchronizerError> {
            Err(SynchronizerError::Api("connection refused".into()))
        }

        async fn post_single(
            &self,
            _token: &str,
            _platform: &str,
            _job: &SingleJob,
        ) -> Result<UpstreamResponse, SynchronizerError> {
            Err(SynchronizerError::Api("connection refused".into()))
        }
    }

    struct RejectingGateway;

    #[async_trait]
    impl JobGateway for RejectingGateway {
        async fn submit_batch(
            &self,
            _token: &str,
            _job: &BatchJob,
        ) -> Result<bool, SynchronizerError> {
            Ok(false)
        }

        async fn post_single(
            &self,
            _token: &str,
            _platform: &str,
            _job: &SingleJob,
        ) -> Result<UpstreamResponse, SynchronizerError> {
            Ok(UpstreamResponse {
                status: 500,
                body: serde_json::json!({ "error": "upstream exploded" }),
            })
        }
    }

    fn single_job() -> SingleJob {
        SingleJob {
            instance_id: "key-1".into(),
            post_id: "7".into(),
            text: Some("hello".into()),
            tags: vec![],
            images: vec![],
            blog_name: None,
        }
    }

    #[tokio::test]
    async fn failed_dispatch_still_records_the_send() {
        let ledger = FakeLedger::with_platforms(&["twitter"]);

        let result =
            dispatch_single(&FailingGateway, &ledger, "jwt", 7, "twitter", &single_job()).await;

        assert!(matches!(result, Err(PublishError::Gateway(_))));
        let (success, error) = ledger.row("twitter");
        assert_eq!(success, Some(false));
        assert!(error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn rejected_dispatch_records_the_upstream_error_text() {
        let ledger = FakeLedger::with_platforms(&["twitter"]);

        let upstream =
            dispatch_single(&RejectingGateway, &ledger, "jwt", 7, "twitter", &single_job())
                .await
                .unwrap();

        assert_eq!(upstream.status, 500);
        assert!(!upstream.succeeded());
        let (success, error) = ledger.row("twitter");
        assert_eq!(success, Some(false));
        assert_eq!(error.as_deref(), Some("upstream exploded"));
    }

    #[tokio::test(start_paused = true)]
    async fn unrecognized_event_types_do_not_end_the_job() {
        let mut channel = ScriptedChannel::new(vec![
            Step::Event(InboundEvent::Unknown),
            progress("tumblr", "success", None),
            summary(&["tumblr"], &[]),
        ]);
        let ledger = FakeLedger::with_platforms(&["tumblr"]);
        let sink = RecordingSink::default();

        let outcome = drive_events(
            &mut channel,
            &ledger,
            &sink,
            7,
            &requested(&["tumblr"]),
            IDLE_TIMEOUT,
            POLL_DEADLINE,
        )
        .await;

        assert_eq!(outcome, JobOutcome::Completed);
        assert_eq!(ledger.row("tumblr"), (Some(true), None));
    }

    struct CountingTokens {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn get_token(&self) -> Result<String, CredentialError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("jwt".into())
        }
    }

    struct CountingConnector {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ChannelConnector for CountingConnector {
        async fn connect(&self) -> Result<Box<dyn EventChannel>, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ChannelError::Disconnected)
        }
    }

    struct CountingGateway {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl JobGateway for CountingGateway {
        async fn submit_batch(
            &self,
            _token: &str,
            _job: &BatchJob,
        ) -> Result<bool, SynchronizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn post_single(
            &self,
            _token: &str,
            _platform: &str,
            _job: &SingleJob,
        ) -> Result<UpstreamResponse, SynchronizerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(UpstreamResponse {
                status: 200,
                body: serde_json::json!({}),
            })
        }
    }

    // A pool whose host is unroutable, so the first query fails fast with a
    // storage error instead of hanging.
    fn unreachable_pool() -> PgPool {
        let options = sqlx::postgres::PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("nobody")
            .database("nowhere");
        sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy_with(options)
    }

    struct SeamCounters {
        tokens: Arc<AtomicUsize>,
        connects: Arc<AtomicUsize>,
        submits: Arc<AtomicUsize>,
    }

    impl SeamCounters {
        fn total(&self) -> usize {
            self.tokens.load(Ordering::SeqCst)
                + self.connects.load(Ordering::SeqCst)
                + self.submits.load(Ordering::SeqCst)
        }
    }

    fn counting_service() -> (PublishService, SeamCounters) {
        let counters = SeamCounters {
            tokens: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
            submits: Arc::new(AtomicUsize::new(0)),
        };
        let service = PublishService::new(
            unreachable_pool(),
            Client::new(),
            Arc::new(CountingTokens {
                calls: counters.tokens.clone(),
            }),
            Arc::new(CountingGateway {
                calls: counters.submits.clone(),
            }),
            Arc::new(CountingConnector {
                calls: counters.connects.clone(),
            }),
            Arc::new(FakeLedger::with_platforms(&[])),
            Arc::new(RecordingSink::default()),
            "key-1",
            false,
        );
        (service, counters)
    }

    #[tokio::test]
    async fn nothing_reaches_the_network_before_sends_are_persisted() {
        let (service, counters) = counting_service();
        let request = PublishRequest {
            platforms: vec!["tumblr".into(), "x".into()],
            text: Some("hello".into()),
            ..Default::default()
        };

        let result = service.publish_all(request).await;

        // Storage is unavailable, so the job never gets past persistence and
        // no token fetch, channel connect, or submission may have happened.
        assert!(matches!(result, Err(PublishError::Persistence(_))));
        assert_eq!(counters.total(), 0);
    }

    #[tokio::test]
    async fn empty_platform_list_is_rejected_without_side_effects() {
        let (service, counters) = counting_service();

        let result = service.publish_all(PublishRequest::default()).await;

        assert!(matches!(result, Err(PublishError::Validation(_))));
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn canonical_platform_list_dedupes_aliases() {
        let names = requested(&["x", "twitter", "Tumblr", "tumblr"]);
        assert_eq!(
            canonical_platform_list(&names),
            vec!["twitter".to_string(), "tumblr".to_string()]
        );
    }

    #[test]
    fn tumblr_requires_a_blog_name() {
        let err = extract_blog_name("tumblr", None).unwrap_err();
        assert!(matches!(err, PublishError::Validation(_)));

        let options = serde_json::json!({ "tumblr": { "blogName": "" } });
        assert!(extract_blog_name("tumblr", Some(&options)).is_err());

        let options = serde_json::json!({ "tumblr": { "blogName": "my-blog" } });
        assert_eq!(
            extract_blog_name("tumblr", Some(&options)).unwrap(),
            Some("my-blog".to_string())
        );

        assert_eq!(extract_blog_name("bluesky", None).unwrap(), None);
    }
}
