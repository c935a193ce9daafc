//! Typed row records.
//!
//! Every table round-trips through an explicit struct; no loose
//! column-index access outside the backend.

use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};

use crate::stage::Stage;

/// A tracked prospect. The email address is the identity key; rows are
/// never deleted.
#[derive(Debug, Clone)]
pub struct Contact {
    pub email: String,
    pub current_stage: Stage,
    pub stage_updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// One effective stage change. Immutable once written.
#[derive(Debug, Clone)]
pub struct StageTransition {
    pub contact_email: String,
    pub from_stage: Stage,
    pub to_stage: Stage,
    pub changed_at: DateTime<Utc>,
}

/// An instrumented outbound send.
///
/// `id` is the opaque tracking id embedded in pixel/click URLs;
/// `message_id` is the transport-level Message-ID header (normalized,
/// no angle brackets) that inbound `In-Reply-To` headers and provider
/// webhooks reference.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub id: String,
    pub message_id: String,
    pub recipient: String,
    pub subject: String,
    pub content_hash: String,
    pub campaign: Option<String>,
    pub sent_at: DateTime<Utc>,
    pub responded: bool,
    pub responded_at: Option<DateTime<Utc>>,
    pub opened: bool,
    pub opened_at: Option<DateTime<Utc>>,
    pub click_count: i64,
    pub clicked_at: Option<DateTime<Utc>>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub failed: bool,
    pub fail_reason: Option<String>,
}

impl OutboundMessage {
    /// Build a fresh record for a just-sent message. All telemetry flags
    /// start cleared; the content hash is derived from the html body.
    pub fn new(
        id: impl Into<String>,
        message_id: impl Into<String>,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        content: &str,
        campaign: Option<&str>,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            message_id: message_id.into(),
            recipient: recipient.into(),
            subject: subject.into(),
            content_hash: content_hash(content),
            campaign: campaign.map(String::from),
            sent_at,
            responded: false,
            responded_at: None,
            opened: false,
            opened_at: None,
            click_count: 0,
            clicked_at: None,
            delivered: false,
            delivered_at: None,
            failed: false,
            fail_reason: None,
        }
    }
}

/// Hash of outbound content, stored instead of the full body.
pub fn content_hash(content: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// A scheduled follow-up tied to an original send.
#[derive(Debug, Clone)]
pub struct FollowUp {
    pub id: String,
    pub parent_id: String,
    /// Day offset from the original send; also selects follow-up content.
    pub sequence_number: i64,
    pub scheduled_at: DateTime<Utc>,
    pub sent: bool,
}

/// A due follow-up joined with its parent's recipient and campaign tag,
/// as returned by the sweep selection query.
#[derive(Debug, Clone)]
pub struct DueFollowUp {
    pub id: String,
    pub parent_id: String,
    pub sequence_number: i64,
    pub recipient: String,
    pub campaign: Option<String>,
}

/// Append-only audit event for a contact.
///
/// The `UNIQUE(contact_email, kind, content)` constraint is the dedup
/// guard: re-processing the same mailbox message inserts nothing.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub contact_email: String,
    pub kind: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregate campaign counters for the read-only stats endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CampaignStats {
    pub contacts: i64,
    pub messages_sent: i64,
    pub responses: i64,
    pub opened: i64,
    pub demos_scheduled: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable() {
        let a = content_hash("<p>hello</p>");
        let b = content_hash("<p>hello</p>");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn content_hash_differs_for_different_content() {
        assert_ne!(content_hash("<p>a</p>"), content_hash("<p>b</p>"));
    }

    #[test]
    fn new_outbound_message_starts_untouched() {
        let msg = OutboundMessage::new(
            "t-1",
            "t-1@example.com",
            "dr.smith@clinic.example",
            "Hello",
            "<p>body</p>",
            Some("spring-launch"),
            Utc::now(),
        );
        assert!(!msg.responded);
        assert!(!msg.opened);
        assert_eq!(msg.click_count, 0);
        assert!(msg.opened_at.is_none());
        assert_eq!(msg.campaign.as_deref(), Some("spring-launch"));
    }
}
