//! Follow-up cadence scheduling and the due-sweep worker.
//!
//! Suppression is lazy: a reply never cancels pending follow-ups, it
//! flips the parent's `responded` flag, and the due-sweep's selection
//! predicate plus the conditional claim skip them when the time comes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::outbound::{ContentRenderer, Mailer};
use crate::store::{Database, FollowUp, OutboundMessage};
use crate::tracking::TrackingRewriter;

/// Creates the fixed follow-up cadence for each sent message.
pub struct FollowUpScheduler {
    db: Arc<dyn Database>,
    cadence_days: Vec<i64>,
}

impl FollowUpScheduler {
    pub fn new(db: Arc<dyn Database>, cadence_days: Vec<i64>) -> Self {
        Self { db, cadence_days }
    }

    /// Insert one follow-up per cadence offset, in a single transaction.
    /// The sequence number doubles as the day offset and selects the
    /// follow-up copy at send time.
    pub async fn schedule_for(
        &self,
        parent: &OutboundMessage,
    ) -> Result<Vec<FollowUp>, DatabaseError> {
        let items: Vec<FollowUp> = self
            .cadence_days
            .iter()
            .map(|days| FollowUp {
                id: Uuid::new_v4().to_string(),
                parent_id: parent.id.clone(),
                sequence_number: *days,
                scheduled_at: parent.sent_at + chrono::Duration::days(*days),
                sent: false,
            })
            .collect();

        self.db.insert_follow_ups(&items).await?;
        debug!(parent = %parent.id, count = items.len(), "Follow-up cadence scheduled");
        Ok(items)
    }
}

/// The periodic due-sweep.
///
/// Each pass selects eligible follow-ups and claims every row with a
/// conditional update before sending. A claim that cannot be taken
/// means another sweep got there first or the prospect replied in the
/// window since selection; either way the row is skipped. A failed send
/// releases the claim so a later sweep retries.
pub struct DueSweep {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    mailer: Arc<dyn Mailer>,
    renderer: Arc<dyn ContentRenderer>,
    rewriter: Arc<TrackingRewriter>,
}

impl DueSweep {
    pub fn new(
        db: Arc<dyn Database>,
        clock: Arc<dyn Clock>,
        mailer: Arc<dyn Mailer>,
        renderer: Arc<dyn ContentRenderer>,
        rewriter: Arc<TrackingRewriter>,
    ) -> Self {
        Self {
            db,
            clock,
            mailer,
            renderer,
            rewriter,
        }
    }

    /// One sweep pass. Returns the number of follow-ups sent.
    pub async fn run_once(&self) -> usize {
        let due = match self.db.due_follow_ups(self.clock.now()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Due-sweep selection failed");
                return 0;
            }
        };
        if due.is_empty() {
            return 0;
        }
        debug!(count = due.len(), "Follow-ups due");

        let mut sent = 0;
        for item in due {
            match self.db.claim_follow_up(&item.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(id = %item.id, "Follow-up already claimed or suppressed");
                    continue;
                }
                Err(e) => {
                    warn!(id = %item.id, error = %e, "Follow-up claim failed");
                    continue;
                }
            }

            let content = self.renderer.follow_up(item.sequence_number).await;
            // Telemetry accrues to the original message, so the follow-up
            // reuses its tracking id.
            let instrumented = self.rewriter.instrument(&content.html, &item.parent_id);

            match self
                .mailer
                .send(
                    &item.recipient,
                    &content.subject,
                    &instrumented.html,
                    Some(&instrumented.pixel),
                )
                .await
            {
                Ok(receipt) => {
                    sent += 1;
                    info!(
                        id = %item.id,
                        recipient = %item.recipient,
                        sequence = item.sequence_number,
                        campaign = item.campaign.as_deref().unwrap_or("-"),
                        "Follow-up sent"
                    );
                    let note =
                        format!("follow-up #{} ({})", item.sequence_number, receipt.message_id);
                    if let Err(e) = self
                        .db
                        .record_interaction(
                            &item.recipient,
                            "follow_up_sent",
                            &note,
                            self.clock.now(),
                        )
                        .await
                    {
                        warn!(id = %item.id, error = %e, "Failed to log follow-up interaction");
                    }
                }
                Err(e) => {
                    warn!(
                        id = %item.id,
                        recipient = %item.recipient,
                        error = %e,
                        "Follow-up send failed, releasing claim"
                    );
                    if let Err(e) = self.db.release_follow_up(&item.id).await {
                        error!(id = %item.id, error = %e, "Failed to release claimed follow-up");
                    }
                }
            }
        }
        sent
    }
}

/// Spawn the due-sweep loop. Returns the handle and a shutdown flag;
/// setting the flag stops the loop at its next tick.
pub fn spawn_due_sweep(
    sweep: Arc<DueSweep>,
    interval_secs: u64,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Due-sweep started — sweeping every {interval_secs}s");
        let mut tick = tokio::time::interval(Duration::from_secs(interval_secs));

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Due-sweep shutting down");
                return;
            }

            sweep.run_once().await;
        }
    });

    (handle, shutdown_flag)
}
