//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::TimestampPolicy;
use crate::error::DatabaseError;
use crate::stage::Stage;
use crate::store::records::{
    CampaignStats, Contact, DueFollowUp, FollowUp, Interaction, OutboundMessage, StageTransition,
};

/// Backend-agnostic database trait covering contacts, outbound messages,
/// follow-ups, and the interaction audit log.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Contacts ────────────────────────────────────────────────────

    /// Look up a contact by email.
    async fn get_contact(&self, email: &str) -> Result<Option<Contact>, DatabaseError>;

    /// Insert a contact if absent. Returns `true` when a row was created.
    /// A concurrent duplicate insert resolves to `false`, never an error.
    async fn insert_contact(
        &self,
        email: &str,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Record an effective stage change: one transition row plus the
    /// contact's `current_stage`/`stage_updated_at` update, atomically.
    async fn apply_stage_change(
        &self,
        email: &str,
        from: Stage,
        to: Stage,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// The most recent transition for a contact, if any.
    async fn latest_transition(
        &self,
        email: &str,
    ) -> Result<Option<StageTransition>, DatabaseError>;

    /// All transitions for a contact, newest first.
    async fn transitions_for(&self, email: &str) -> Result<Vec<StageTransition>, DatabaseError>;

    /// All contacts, most recently updated first.
    async fn list_contacts(&self) -> Result<Vec<Contact>, DatabaseError>;

    // ── Outbound messages ───────────────────────────────────────────

    /// Persist a sent message.
    async fn insert_outbound(&self, msg: &OutboundMessage) -> Result<(), DatabaseError>;

    /// Look up by tracking id.
    async fn get_outbound(&self, id: &str) -> Result<Option<OutboundMessage>, DatabaseError>;

    /// Look up by transport Message-ID (normalized, no angle brackets).
    async fn get_outbound_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError>;

    /// Set the responded flag. Idempotent: returns `true` only when the
    /// flag was newly set; an already-responded message is a no-op.
    async fn mark_responded(&self, id: &str, at: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Set the opened flag; the timestamp obeys the given policy.
    async fn mark_opened(
        &self,
        id: &str,
        at: DateTime<Utc>,
        policy: TimestampPolicy,
    ) -> Result<(), DatabaseError>;

    /// Increment the click counter and stamp `clicked_at` per policy.
    async fn record_click(
        &self,
        id: &str,
        at: DateTime<Utc>,
        policy: TimestampPolicy,
    ) -> Result<(), DatabaseError>;

    /// Set the delivered flag; the timestamp obeys the given policy.
    async fn mark_delivered(
        &self,
        id: &str,
        at: DateTime<Utc>,
        policy: TimestampPolicy,
    ) -> Result<(), DatabaseError>;

    /// Record a hard delivery failure with the provider's reason.
    async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), DatabaseError>;

    /// Aggregate counters for the stats endpoint.
    async fn campaign_stats(&self) -> Result<CampaignStats, DatabaseError>;

    // ── Follow-ups ──────────────────────────────────────────────────

    /// Insert a full cadence of follow-ups for one parent, atomically.
    async fn insert_follow_ups(&self, items: &[FollowUp]) -> Result<(), DatabaseError>;

    /// Follow-ups eligible to fire: due, unsent, parent not responded.
    async fn due_follow_ups(&self, now: DateTime<Utc>) -> Result<Vec<DueFollowUp>, DatabaseError>;

    /// Claim a follow-up for sending. Conditional update: succeeds only
    /// if the row is still unsent and the parent is still unresponded.
    /// Exactly one of any number of concurrent claimants wins.
    async fn claim_follow_up(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Release a claimed follow-up after a failed send so a later sweep
    /// retries it.
    async fn release_follow_up(&self, id: &str) -> Result<(), DatabaseError>;

    /// All follow-ups for a parent message, in sequence order.
    async fn follow_ups_for(&self, parent_id: &str) -> Result<Vec<FollowUp>, DatabaseError>;

    // ── Interactions ────────────────────────────────────────────────

    /// Append an audit event. Returns `true` when a row was inserted;
    /// a duplicate `(contact, kind, content)` is absorbed and returns
    /// `false`.
    async fn record_interaction(
        &self,
        contact_email: &str,
        kind: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Audit events for a contact, newest first.
    async fn interactions_for(&self, email: &str) -> Result<Vec<Interaction>, DatabaseError>;
}
