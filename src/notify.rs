//! Fire-and-forget webhook delivery (§4.8, ambient addition). Modeled on the
//! teacher's `webhooks.rs`: a bounded-concurrency semaphore gates outbound
//! requests, failures are logged and retried with backoff, and they never
//! touch job state (§7 "Transient external failure").

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::config::{NotificationsConfig, WebhookConfig};
use crate::job::{Job, JobStatus, NotificationChannel};

#[derive(Clone)]
struct Target {
    channel: NotificationChannel,
    url: String,
    headers: HashMap<String, String>,
    timeout: Duration,
    max_retries: u32,
}

pub struct Notifier {
    client: Option<reqwest::Client>,
    semaphore: Arc<Semaphore>,
    targets: Vec<Target>,
}

#[derive(Debug, Clone, Serialize)]
struct WebhookPayload {
    event: String,
    job_id: String,
    user: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wandb_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    edits_message_id: Option<String>,
}

impl Notifier {
    pub fn new(config: &NotificationsConfig) -> Self {
        if !config.enabled || config.webhooks.is_empty() {
            return Self::disabled();
        }

        let client = match reqwest::Client::builder()
            .user_agent(format!("nexus/{}/webhooks", env!("CARGO_PKG_VERSION")))
            .build()
        {
            Ok(c) => Some(c),
            Err(e) => {
                tracing::error!(error = %e, "webhook notifier disabled: failed to build HTTP client");
                None
            }
        };

        let targets = config
            .webhooks
            .iter()
            .filter_map(|w| Self::target_from_config(w))
            .collect();

        Self {
            client,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_deliveries.max(1))),
            targets,
        }
    }

    pub fn disabled() -> Self {
        Self {
            client: None,
            semaphore: Arc::new(Semaphore::new(1)),
            targets: Vec::new(),
        }
    }

    fn target_from_config(w: &WebhookConfig) -> Option<Target> {
        use std::str::FromStr;
        let channel = match NotificationChannel::from_str(&w.channel) {
            Ok(c) => c,
            Err(_) => {
                tracing::error!(channel = %w.channel, "ignoring webhook with unknown channel");
                return None;
            }
        };
        if w.url.trim().is_empty() {
            tracing::error!("ignoring webhook with empty url");
            return None;
        }
        Some(Target {
            channel,
            url: w.url.clone(),
            headers: w.headers.clone(),
            timeout: Duration::from_secs(w.timeout_secs.max(1)),
            max_retries: w.max_retries,
        })
    }

    fn matching_targets<'a>(&'a self, job: &'a Job) -> impl Iterator<Item = &'a Target> + 'a {
        self.targets
            .iter()
            .filter(move |t| job.notifications.contains(&t.channel))
    }

    /// Sends the `started` notification; returns the synthetic message ids
    /// minted per channel so a later tracker-url discovery (task 3) can
    /// reference them for an edit.
    pub async fn notify_started(&self, job: &Job) -> HashMap<String, String> {
        let Some(client) = &self.client else {
            return HashMap::new();
        };
        let mut message_ids = HashMap::new();
        for target in self.matching_targets(job) {
            let message_id = crate::util::random_id();
            let payload = WebhookPayload {
                event: "job_started".to_string(),
                job_id: job.id.clone(),
                user: job.user.to_string(),
                status: JobStatus::Running.to_string(),
                exit_code: None,
                error_message: None,
                wandb_url: None,
                edits_message_id: None,
            };
            self.deliver(client.clone(), target.clone(), payload).await;
            message_ids.insert(target.channel.to_string(), message_id);
        }
        message_ids
    }

    /// Sends the terminal (`completed`/`failed`/`killed`) notification.
    pub async fn notify_terminal(&self, job: &Job) {
        let Some(client) = &self.client else { return };
        let event = match job.status {
            JobStatus::Completed => "job_completed",
            JobStatus::Failed => "job_failed",
            JobStatus::Killed => "job_killed",
            _ => return,
        };
        for target in self.matching_targets(job) {
            let payload = WebhookPayload {
                event: event.to_string(),
                job_id: job.id.clone(),
                user: job.user.to_string(),
                status: job.status.to_string(),
                exit_code: job.exit_code,
                error_message: job.error_message.clone(),
                wandb_url: None,
                edits_message_id: None,
            };
            self.deliver(client.clone(), target.clone(), payload).await;
        }
    }

    /// Edits the `started` message (if one was sent) with the discovered
    /// tracker URL, per §4.5 task 3.
    pub async fn notify_tracker_url(&self, job: &Job, url: &str) {
        let Some(client) = &self.client else { return };
        for target in self.matching_targets(job) {
            let edits = job.notification_messages.get(&target.channel.to_string()).cloned();
            let payload = WebhookPayload {
                event: "job_tracker_url".to_string(),
                job_id: job.id.clone(),
                user: job.user.to_string(),
                status: job.status.to_string(),
                exit_code: None,
                error_message: None,
                wandb_url: Some(url.to_string()),
                edits_message_id: edits,
            };
            self.deliver(client.clone(), target.clone(), payload).await;
        }
    }

    async fn deliver(&self, client: reqwest::Client, target: Target, payload: WebhookPayload) {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = deliver_with_retries(&client, &target, &payload).await {
                tracing::warn!(
                    url = %target.url,
                    event = %payload.event,
                    error = %e,
                    "webhook delivery failed"
                );
            }
        });
    }
}

async fn deliver_with_retries(
    client: &reqwest::Client,
    target: &Target,
    payload: &WebhookPayload,
) -> anyhow::Result<()> {
    let max_attempts = 1u32.saturating_add(target.max_retries);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match deliver_once(client, target, payload).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < max_attempts => {
                tracing::debug!(attempt, max_attempts, error = %e, "webhook delivery attempt failed, retrying");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let secs = 2u64.saturating_pow(attempt.saturating_sub(1).min(5));
    Duration::from_secs(secs.clamp(1, 30))
}

async fn deliver_once(
    client: &reqwest::Client,
    target: &Target,
    payload: &WebhookPayload,
) -> anyhow::Result<()> {
    let mut req = client.post(&target.url).json(payload).timeout(target.timeout);
    for (k, v) in &target.headers {
        let name = reqwest::header::HeaderName::from_bytes(k.as_bytes())
            .map_err(|_| anyhow::anyhow!("invalid header name: {k}"))?;
        let value = reqwest::header::HeaderValue::from_str(v)
            .map_err(|_| anyhow::anyhow!("invalid header value for {k}"))?;
        req = req.header(name, value);
    }
    let resp = req.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
        let body = resp.text().await.unwrap_or_default();
        anyhow::bail!("HTTP {status} (non-retriable): {body}");
    }
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("HTTP {status}: {body}");
}
