//! Notifications (SPEC_FULL §6/§4.8): fire-and-forget operator alerts for
//! run failures, circuit-breaker trips, auto-disable, and recovery.
//!
//! Fire-and-forget over a background OS thread, the same non-blocking
//! delivery shape the webhook client elsewhere in this stack uses — the
//! run's own future must never wait on notifier I/O, and a delivery
//! failure must never fail the run.

use chrono::{DateTime, Utc};
use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use serde::Serialize;
use slack_hook::{PayloadBuilder, Slack};
use tracing::warn;
use uuid::Uuid;

use crate::config::NotificationSettings;

/// Events the orchestrator raises over the run lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum NotificationEvent {
    FeedRunFailed {
        feed_id: Uuid,
        run_id: Uuid,
        failure_code: String,
        failure_message: String,
        correlation_id: Uuid,
    },
    CircuitBreakerTriggered {
        feed_id: Uuid,
        run_id: Uuid,
        would_expire_count: u64,
        active_count_before: u64,
    },
    FeedAutoDisabled {
        feed_id: Uuid,
        consecutive_failures: u32,
    },
    FeedRecovered {
        feed_id: Uuid,
        run_id: Uuid,
    },
}

impl NotificationEvent {
    fn subject(&self) -> String {
        match self {
            NotificationEvent::FeedRunFailed { feed_id, .. } => {
                format!("Feed run failed: {feed_id}")
            }
            NotificationEvent::CircuitBreakerTriggered { feed_id, .. } => {
                format!("Circuit breaker triggered: {feed_id}")
            }
            NotificationEvent::FeedAutoDisabled { feed_id, .. } => {
                format!("Feed auto-disabled: {feed_id}")
            }
            NotificationEvent::FeedRecovered { feed_id, .. } => {
                format!("Feed recovered: {feed_id}")
            }
        }
    }

    fn body(&self) -> String {
        match self {
            NotificationEvent::FeedRunFailed {
                run_id,
                failure_code,
                failure_message,
                correlation_id,
                ..
            } => format!(
                "run {run_id} failed with code {failure_code}: {failure_message} (correlation {correlation_id})"
            ),
            NotificationEvent::CircuitBreakerTriggered {
                run_id,
                would_expire_count,
                active_count_before,
                ..
            } => format!(
                "run {run_id} blocked promotion: {would_expire_count} of {active_count_before} active products would have expired"
            ),
            NotificationEvent::FeedAutoDisabled {
                consecutive_failures,
                ..
            } => format!("disabled after {consecutive_failures} consecutive failed runs"),
            NotificationEvent::FeedRecovered { run_id, .. } => {
                format!("run {run_id} succeeded after a prior failing streak")
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct NotificationPayload {
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    event: NotificationEvent,
}

/// Fans notification events out to whichever transports are configured.
/// Cloneable and cheap: holds only owned config, no open connections.
#[derive(Clone)]
pub struct Notifier {
    settings: NotificationSettings,
}

impl Notifier {
    pub fn new(settings: NotificationSettings) -> Self {
        Self { settings }
    }

    /// Dispatch on a background OS thread and return immediately. Never
    /// propagates delivery failures; logs them instead.
    pub fn notify(&self, event: NotificationEvent) {
        let settings = self.settings.clone();
        let payload = NotificationPayload {
            timestamp: Utc::now(),
            event,
        };

        std::thread::spawn(move || {
            if let Err(err) = deliver_email(&settings, &payload) {
                warn!(error = %err, "email notification delivery failed (non-blocking)");
            }
            if let Err(err) = deliver_slack(&settings, &payload) {
                warn!(error = %err, "slack notification delivery failed (non-blocking)");
            }
        });
    }
}

fn deliver_email(
    settings: &NotificationSettings,
    payload: &NotificationPayload,
) -> Result<(), String> {
    let (Some(smtp_url), Some(from), Some(to)) = (
        settings.smtp_url.as_deref(),
        settings.from_address.as_deref(),
        settings.operator_email.as_deref(),
    ) else {
        return Ok(());
    };

    let message = Message::builder()
        .from(from.parse().map_err(|e| format!("invalid from address: {e}"))?)
        .to(to.parse().map_err(|e| format!("invalid to address: {e}"))?)
        .subject(payload.event.subject())
        .body(payload.event.body())
        .map_err(|e| format!("failed to build message: {e}"))?;

    let mailer = if smtp_url.starts_with("smtps://") || smtp_url.starts_with("smtp://") {
        SmtpTransport::from_url(smtp_url)
            .map_err(|e| format!("invalid smtp url: {e}"))?
            .build()
    } else {
        let mut builder = SmtpTransport::relay(smtp_url)
            .map_err(|e| format!("failed to resolve smtp relay: {e}"))?;
        if let (Some(user), Some(pass)) = (
            std::env::var("SMTP_USERNAME").ok(),
            std::env::var("SMTP_PASSWORD").ok(),
        ) {
            builder = builder.credentials(Credentials::new(user, pass));
        }
        builder.build()
    };

    mailer
        .send(&message)
        .map_err(|e| format!("smtp send failed: {e}"))?;
    Ok(())
}

fn deliver_slack(
    settings: &NotificationSettings,
    payload: &NotificationPayload,
) -> Result<(), String> {
    let Some(webhook_url) = settings.slack_webhook_url.as_deref() else {
        return Ok(());
    };

    let slack = Slack::new(webhook_url).map_err(|e| format!("invalid slack webhook url: {e}"))?;
    let text = format!("{}\n{}", payload.event.subject(), payload.event.body());
    let slack_payload = PayloadBuilder::new()
        .text(text)
        .build()
        .map_err(|e| format!("failed to build slack payload: {e}"))?;

    slack
        .send(&slack_payload)
        .map_err(|e| format!("slack send failed: {e:?}"))?;
    Ok(())
}
