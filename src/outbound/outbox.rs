//! The campaign send path: instrument, deliver, persist, schedule.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::Result;
use crate::followup::FollowUpScheduler;
use crate::outbound::Mailer;
use crate::stage::{Stage, StageTracker};
use crate::store::{Database, OutboundMessage};
use crate::tracking::TrackingRewriter;

/// Orchestrates one outbound campaign send end to end.
pub struct Outbox {
    db: Arc<dyn Database>,
    mailer: Arc<dyn Mailer>,
    rewriter: Arc<TrackingRewriter>,
    scheduler: Arc<FollowUpScheduler>,
    tracker: Arc<StageTracker>,
    clock: Arc<dyn Clock>,
}

impl Outbox {
    pub fn new(
        db: Arc<dyn Database>,
        mailer: Arc<dyn Mailer>,
        rewriter: Arc<TrackingRewriter>,
        scheduler: Arc<FollowUpScheduler>,
        tracker: Arc<StageTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            mailer,
            rewriter,
            scheduler,
            tracker,
            clock,
        }
    }

    /// Send one campaign email. A fresh tracking id is embedded in the
    /// content, the message is persisted with its follow-up cadence, and
    /// the contact moves to `contacted`. Nothing is persisted when the
    /// transport refuses the message, so a failed send can simply be
    /// retried.
    pub async fn send_campaign(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        campaign: Option<&str>,
    ) -> Result<OutboundMessage> {
        let tracking_id = Uuid::new_v4().to_string();
        let instrumented = self.rewriter.instrument(html, &tracking_id);

        let receipt = self
            .mailer
            .send(to, subject, &instrumented.html, Some(&instrumented.pixel))
            .await?;

        let message = OutboundMessage::new(
            tracking_id,
            receipt.message_id,
            to,
            subject,
            &instrumented.html,
            campaign,
            self.clock.now(),
        );
        self.db.insert_outbound(&message).await?;
        self.scheduler.schedule_for(&message).await?;

        self.tracker.transition(to, Stage::Contacted).await?;
        self.db
            .record_interaction(to, "sent_email", subject, message.sent_at)
            .await?;

        info!(recipient = %to, id = %message.id, "Campaign email sent");
        Ok(message)
    }
}
