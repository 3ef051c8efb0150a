//! Webhook Notifier: fan-out of job lifecycle events with per-subscriber
//! retry/backoff. Delivery is asynchronous and never blocks the publisher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Event type tag, matching the six job lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    JobCreated,
    JobStarted,
    JobProgress,
    JobCompleted,
    JobFailed,
    JobCancelled,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::JobCreated => "job.created",
            EventType::JobStarted => "job.started",
            EventType::JobProgress => "job.progress",
            EventType::JobCompleted => "job.completed",
            EventType::JobFailed => "job.failed",
            EventType::JobCancelled => "job.cancelled",
        }
    }
}

/// Semantic event envelope (not a wire format — collaborators choose the
/// transport encoding).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub job_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EventEnvelope {
    event_type: &'static str,
    timestamp: DateTime<Utc>,
    payload: serde_json::Value,
}

/// A single webhook subscription.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: Uuid,
    pub url: String,
    /// `["*"]` matches every event type; otherwise the event's type must
    /// literally appear in this list.
    pub event_mask: Vec<String>,
    pub headers: HashMap<String, String>,
    pub timeout: Duration,
    pub retry_count: u32,
}

impl Subscriber {
    fn matches(&self, event_type: EventType) -> bool {
        self.event_mask.iter().any(|m| m == "*") || self.event_mask.iter().any(|m| m == event_type.as_str())
    }
}

/// Backoff policy for webhook delivery: base 1s, factor 2, cap 60s, no
/// jitter (matching the deterministic interval assertion in the spec's
/// testable properties).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given 1-indexed retry attempt (attempt 1 is the
    /// first *retry*, i.e. the second POST overall).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as f64;
        let secs = self.base_delay.as_secs_f64() * self.factor.powf(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Whether an HTTP status should be retried per the policy in §4.4.
fn is_retryable_status(status: u16) -> bool {
    status >= 500 || status == 429
}

/// Fan-out notifier. The subscriber list is copy-on-write: every mutation
/// swaps in a freshly cloned `Arc<Vec<_>>` so publishers reading the
/// current list never observe a torn update.
pub struct WebhookNotifier {
    subscribers: RwLock<Arc<Vec<Subscriber>>>,
    client: reqwest::Client,
    retry_policy: RetryPolicy,
}

impl WebhookNotifier {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            client: reqwest::Client::new(),
            retry_policy,
        }
    }

    pub fn add_subscriber(&self, subscriber: Subscriber) {
        let mut guard = self.subscribers.write().expect("subscriber lock poisoned");
        let mut next = (**guard).clone();
        next.push(subscriber);
        *guard = Arc::new(next);
    }

    pub fn remove_subscriber(&self, id: Uuid) {
        let mut guard = self.subscribers.write().expect("subscriber lock poisoned");
        let next: Vec<Subscriber> = guard.iter().filter(|s| s.id != id).cloned().collect();
        *guard = Arc::new(next);
    }

    fn current_subscribers(&self) -> Arc<Vec<Subscriber>> {
        self.subscribers.read().expect("subscriber lock poisoned").clone()
    }

    /// Schedules delivery to every matching subscriber. Returns
    /// immediately; delivery (including all retries) happens on spawned
    /// tasks. A no-op when there are no subscribers.
    pub fn publish(&self, event: Event) {
        let subscribers = self.current_subscribers();
        if subscribers.is_empty() {
            return;
        }
        let envelope = EventEnvelope {
            event_type: event.event_type.as_str(),
            timestamp: event.timestamp,
            payload: event.payload,
        };

        for subscriber in subscribers.iter() {
            if !subscriber.matches(event.event_type) {
                continue;
            }
            let client = self.client.clone();
            let subscriber = subscriber.clone();
            let policy = self.retry_policy.clone();
            let envelope = envelope.clone();
            tokio::spawn(async move {
                deliver_with_retry(&client, &subscriber, &envelope, &policy).await;
            });
        }
    }

    /// Sends a single test POST to `url`, bypassing the subscriber list
    /// and retry policy. Used to validate a webhook endpoint before
    /// registering it.
    pub async fn test(&self, url: &str) -> Result<(), String> {
        let body = EventEnvelope {
            event_type: "webhook.test",
            timestamp: Utc::now(),
            payload: serde_json::json!({}),
        };
        self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())
            .and_then(|resp| {
                if resp.status().is_success() {
                    Ok(())
                } else {
                    Err(format!("non-2xx response: {}", resp.status()))
                }
            })
    }
}

async fn deliver_with_retry(
    client: &reqwest::Client,
    subscriber: &Subscriber,
    envelope: &EventEnvelope,
    policy: &RetryPolicy,
) {
    let mut attempt = 0u32;
    loop {
        let mut request = client.post(&subscriber.url).json(envelope).timeout(subscriber.timeout);
        for (key, value) in &subscriber.headers {
            request = request.header(key, value);
        }

        let outcome = request.send().await;
        match outcome {
            Ok(resp) if resp.status().is_success() || resp.status().is_redirection() => {
                debug!(url = %subscriber.url, "webhook delivered");
                return;
            }
            Ok(resp) if is_retryable_status(resp.status().as_u16()) => {
                warn!(url = %subscriber.url, status = %resp.status(), attempt, "retryable webhook failure");
            }
            Ok(resp) => {
                warn!(url = %subscriber.url, status = %resp.status(), "terminal webhook failure, not retrying");
                return;
            }
            Err(e) => {
                warn!(url = %subscriber.url, error = %e, attempt, "webhook network error");
            }
        }

        if attempt >= subscriber.retry_count {
            warn!(url = %subscriber.url, "webhook delivery exhausted retries");
            return;
        }
        attempt += 1;
        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
    }
}
