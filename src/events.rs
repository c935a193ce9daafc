//! Delivery-provider and scheduling-link event ingestion.
//!
//! The provider delivers events at-least-once, so every handler here
//! must absorb repeats: timestamp fields follow the configured
//! `TimestampPolicy`, flag flips are idempotent, and an event for an
//! unknown or unidentified message is dropped, never an error.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::TimestampPolicy;
use crate::error::Result;
use crate::inbound::{InboundSignal, normalize_message_id};
use crate::outbound::{ContentRenderer, Mailer};
use crate::stage::{Stage, StageTracker};
use crate::store::Database;

// ── Delivery-provider events ────────────────────────────────────────

/// Webhook envelope the delivery provider posts.
#[derive(Debug, Deserialize)]
pub struct DeliveryEnvelope {
    pub event: String,
    #[serde(default)]
    pub message: Option<EnvelopeMessage>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EnvelopeMessage {
    pub headers: EnvelopeHeaders,
}

#[derive(Debug, Deserialize)]
pub struct EnvelopeHeaders {
    #[serde(rename = "message-id", default)]
    pub message_id: Option<String>,
}

/// Applies delivery events to tracked outbound messages.
pub struct EventIngestor {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    policy: TimestampPolicy,
}

impl EventIngestor {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>, policy: TimestampPolicy) -> Self {
        Self { db, clock, policy }
    }

    /// Apply one provider event. An envelope without a message id is
    /// dropped with a warning.
    pub async fn ingest(&self, envelope: &DeliveryEnvelope) -> Result<()> {
        let Some(raw_id) = envelope
            .message
            .as_ref()
            .and_then(|m| m.headers.message_id.as_deref())
        else {
            warn!(event = %envelope.event, "Delivery event without message id dropped");
            return Ok(());
        };

        let message_id = normalize_message_id(raw_id);
        let Some(message) = self.db.get_outbound_by_message_id(&message_id).await? else {
            debug!(message_id = %message_id, "Delivery event for unknown message ignored");
            return Ok(());
        };

        let now = self.clock.now();
        match envelope.event.as_str() {
            "opened" => {
                self.db.mark_opened(&message.id, now, self.policy).await?;
                debug!(id = %message.id, "Message opened");
            }
            "clicked" => {
                self.db.record_click(&message.id, now, self.policy).await?;
                debug!(id = %message.id, "Message link clicked");
            }
            "delivered" => {
                self.db.mark_delivered(&message.id, now, self.policy).await?;
            }
            "failed" => {
                let reason = envelope.reason.as_deref().unwrap_or("unknown");
                self.db.mark_failed(&message.id, reason).await?;
                warn!(id = %message.id, reason, "Delivery failed");
            }
            other => {
                debug!(event = %other, "Unhandled delivery event type");
            }
        }
        Ok(())
    }
}

/// Inbound email relayed by the provider's inbound route. Field names
/// match what the provider posts.
#[derive(Debug, Deserialize)]
pub struct InboundEmailPayload {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(rename = "body-plain", default)]
    pub body_plain: Option<String>,
    #[serde(rename = "Message-Id", default)]
    pub message_id: Option<String>,
    #[serde(rename = "In-Reply-To", default)]
    pub in_reply_to: Option<String>,
}

impl InboundEmailPayload {
    /// Convert to the common inbound signal so provider-relayed replies
    /// run the same path as polled mailbox replies. `None` when the
    /// payload carries no sender.
    pub fn into_signal(self) -> Option<InboundSignal> {
        let from = self.from?;
        Some(InboundSignal {
            message_id: self
                .message_id
                .map(|id| normalize_message_id(&id))
                .unwrap_or_else(|| format!("gen-{}", uuid::Uuid::new_v4())),
            in_reply_to: self.in_reply_to,
            from: extract_address(&from),
            subject: self.subject.unwrap_or_default(),
            body: self.body_plain.unwrap_or_default(),
        })
    }
}

/// Bare address from a `Name <addr>` display form.
fn extract_address(from: &str) -> String {
    match (from.find('<'), from.find('>')) {
        (Some(start), Some(end)) if start < end => from[start + 1..end].trim().to_string(),
        _ => from.trim().to_string(),
    }
}

// ── Scheduling-link events ──────────────────────────────────────────

/// Webhook envelope the scheduling link posts on booking changes.
#[derive(Debug, Deserialize)]
pub struct SchedulingEnvelope {
    pub event: String,
    pub payload: SchedulingPayload,
}

#[derive(Debug, Deserialize)]
pub struct SchedulingPayload {
    pub invitee: Invitee,
}

#[derive(Debug, Deserialize)]
pub struct Invitee {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub event: Option<InviteeEvent>,
}

#[derive(Debug, Deserialize)]
pub struct InviteeEvent {
    pub start_time: String,
}

/// Handles booking lifecycle events from the scheduling link.
pub struct SchedulingHandler {
    tracker: Arc<StageTracker>,
    mailer: Arc<dyn Mailer>,
    renderer: Arc<dyn ContentRenderer>,
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
}

impl SchedulingHandler {
    pub fn new(
        tracker: Arc<StageTracker>,
        mailer: Arc<dyn Mailer>,
        renderer: Arc<dyn ContentRenderer>,
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            tracker,
            mailer,
            renderer,
            db,
            clock,
        }
    }

    /// Apply one scheduling event. The stage transition is the source of
    /// truth; the courtesy email afterwards is best-effort.
    pub async fn handle(&self, envelope: &SchedulingEnvelope) -> Result<()> {
        let invitee = &envelope.payload.invitee;

        match envelope.event.as_str() {
            "invitee.created" => {
                self.tracker
                    .transition(&invitee.email, Stage::DemoScheduled)
                    .await?;
                let start_time = invitee
                    .event
                    .as_ref()
                    .map(|e| e.start_time.as_str())
                    .unwrap_or("(time to be confirmed)");
                self.db
                    .record_interaction(&invitee.email, "demo_booked", start_time, self.clock.now())
                    .await?;
                info!(invitee = %invitee.email, start_time, "Demo booked");

                let name = invitee.name.as_deref().unwrap_or("there");
                let content = self.renderer.booking_confirmation(name, start_time).await;
                if let Err(e) = self
                    .mailer
                    .send(&invitee.email, &content.subject, &content.html, None)
                    .await
                {
                    warn!(invitee = %invitee.email, error = %e, "Booking confirmation send failed");
                }
            }
            "invitee.canceled" => {
                self.tracker
                    .transition(&invitee.email, Stage::DemoCanceled)
                    .await?;
                self.db
                    .record_interaction(
                        &invitee.email,
                        "demo_canceled",
                        "invitee.canceled",
                        self.clock.now(),
                    )
                    .await?;
                info!(invitee = %invitee.email, "Demo canceled");

                let content = self.renderer.cancellation_follow_up().await;
                if let Err(e) = self
                    .mailer
                    .send(&invitee.email, &content.subject, &content.html, None)
                    .await
                {
                    warn!(invitee = %invitee.email, error = %e, "Cancellation follow-up send failed");
                }
            }
            other => {
                debug!(event = %other, "Unhandled scheduling event type");
            }
        }
        Ok(())
    }
}
