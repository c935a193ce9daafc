//! Engagement stages and the per-contact state machine.
//!
//! Stages form a flat label set: classification does not depend on the
//! current stage, so any stage may be entered from any other. The one
//! entry rule is that proposing the stage a contact is already in is a
//! no-op — no audit row, no timestamp bump — which keeps repeated polling
//! of an already-classified message from flooding the history.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::store::Database;

/// A label in a contact's engagement lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    New,
    Contacted,
    Responded,
    Interested,
    NotInterested,
    DemoScheduled,
    DemoCanceled,
    Converted,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::New => "new",
            Stage::Contacted => "contacted",
            Stage::Responded => "responded",
            Stage::Interested => "interested",
            Stage::NotInterested => "not_interested",
            Stage::DemoScheduled => "demo_scheduled",
            Stage::DemoCanceled => "demo_canceled",
            Stage::Converted => "converted",
        }
    }

    /// Parse a stage label from its DB string. Unknown labels map to
    /// `New` so a half-migrated row never poisons a read path.
    pub fn parse(s: &str) -> Stage {
        match s {
            "contacted" => Stage::Contacted,
            "responded" => Stage::Responded,
            "interested" => Stage::Interested,
            "not_interested" => Stage::NotInterested,
            "demo_scheduled" => Stage::DemoScheduled,
            "demo_canceled" => Stage::DemoCanceled,
            "converted" => Stage::Converted,
            _ => Stage::New,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a transition proposal.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    /// The contact's identity key (created if it did not exist).
    pub contact: String,
    /// Whether the proposal changed the stage and wrote an audit row.
    pub applied: bool,
}

/// Owns per-contact stage mutation.
///
/// Each `transition()` call is an atomic read-modify-write: a per-contact
/// async lock keeps two concurrent proposals for the same contact from
/// interleaving between the stage read and the conditional write.
pub struct StageTracker {
    db: Arc<dyn Database>,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StageTracker {
    pub fn new(db: Arc<dyn Database>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Propose a stage for a contact, creating the contact on first
    /// signal (initial stage `new`). Writes one `StageTransition` row iff
    /// the proposal differs from the current stage.
    pub async fn transition(
        &self,
        email: &str,
        proposed: Stage,
    ) -> Result<TransitionOutcome, DatabaseError> {
        let lock = self.contact_lock(email).await;
        let _guard = lock.lock().await;

        let now = self.clock.now();

        let current = match self.db.get_contact(email).await? {
            Some(contact) => contact.current_stage,
            None => {
                // Another process may have created the row between our
                // read and this insert; INSERT OR IGNORE + re-read keeps
                // both outcomes consistent.
                self.db.insert_contact(email, Stage::New, now).await?;
                self.db
                    .get_contact(email)
                    .await?
                    .map(|c| c.current_stage)
                    .unwrap_or(Stage::New)
            }
        };

        if current == proposed {
            debug!(contact = %email, stage = %proposed, "Stage unchanged, skipping");
            return Ok(TransitionOutcome {
                contact: email.to_string(),
                applied: false,
            });
        }

        self.db
            .apply_stage_change(email, current, proposed, now)
            .await?;

        info!(contact = %email, from = %current, to = %proposed, "Stage transition");

        Ok(TransitionOutcome {
            contact: email.to_string(),
            applied: true,
        })
    }

    async fn contact_lock(&self, email: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(email.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::LibSqlBackend;
    use chrono::{Duration, Utc};

    async fn tracker() -> (StageTracker, Arc<dyn Database>, Arc<ManualClock>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (
            StageTracker::new(Arc::clone(&db), clock.clone()),
            db,
            clock,
        )
    }

    #[test]
    fn stage_labels_round_trip() {
        for stage in [
            Stage::New,
            Stage::Contacted,
            Stage::Responded,
            Stage::Interested,
            Stage::NotInterested,
            Stage::DemoScheduled,
            Stage::DemoCanceled,
            Stage::Converted,
        ] {
            assert_eq!(Stage::parse(stage.as_str()), stage);
        }
    }

    #[test]
    fn unknown_label_parses_as_new() {
        assert_eq!(Stage::parse("garbage"), Stage::New);
    }

    #[tokio::test]
    async fn creates_contact_on_first_signal() {
        let (tracker, db, _) = tracker().await;

        let outcome = tracker
            .transition("a@x.com", Stage::Interested)
            .await
            .unwrap();
        assert!(outcome.applied);

        let contact = db.get_contact("a@x.com").await.unwrap().unwrap();
        assert_eq!(contact.current_stage, Stage::Interested);

        let latest = db.latest_transition("a@x.com").await.unwrap().unwrap();
        assert_eq!(latest.from_stage, Stage::New);
        assert_eq!(latest.to_stage, Stage::Interested);
    }

    #[tokio::test]
    async fn proposing_new_for_fresh_contact_is_noop() {
        let (tracker, db, _) = tracker().await;

        let outcome = tracker.transition("a@x.com", Stage::New).await.unwrap();
        assert!(!outcome.applied);

        // Contact exists but no transition row was written
        assert!(db.get_contact("a@x.com").await.unwrap().is_some());
        assert!(db.latest_transition("a@x.com").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_stage_twice_writes_one_row() {
        let (tracker, db, _) = tracker().await;

        let first = tracker
            .transition("a@x.com", Stage::Interested)
            .await
            .unwrap();
        let second = tracker
            .transition("a@x.com", Stage::Interested)
            .await
            .unwrap();

        assert!(first.applied);
        assert!(!second.applied);

        let history = db.transitions_for("a@x.com").await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn noop_does_not_bump_timestamp() {
        let (tracker, db, clock) = tracker().await;

        tracker
            .transition("a@x.com", Stage::Interested)
            .await
            .unwrap();
        let before = db.get_contact("a@x.com").await.unwrap().unwrap();

        clock.advance(Duration::hours(2));
        tracker
            .transition("a@x.com", Stage::Interested)
            .await
            .unwrap();
        let after = db.get_contact("a@x.com").await.unwrap().unwrap();

        assert_eq!(before.stage_updated_at, after.stage_updated_at);
    }

    #[tokio::test]
    async fn current_stage_tracks_latest_transition() {
        let (tracker, db, _) = tracker().await;

        for stage in [Stage::Contacted, Stage::Responded, Stage::DemoScheduled] {
            tracker.transition("a@x.com", stage).await.unwrap();

            let contact = db.get_contact("a@x.com").await.unwrap().unwrap();
            let latest = db.latest_transition("a@x.com").await.unwrap().unwrap();
            assert_eq!(contact.current_stage, latest.to_stage);
        }
    }

    #[tokio::test]
    async fn any_stage_reachable_from_any_other() {
        let (tracker, db, _) = tracker().await;

        // Demo canceled straight back to interested, then converted —
        // no DAG restrictions.
        tracker
            .transition("a@x.com", Stage::DemoCanceled)
            .await
            .unwrap();
        tracker
            .transition("a@x.com", Stage::Interested)
            .await
            .unwrap();
        tracker
            .transition("a@x.com", Stage::Converted)
            .await
            .unwrap();

        let contact = db.get_contact("a@x.com").await.unwrap().unwrap();
        assert_eq!(contact.current_stage, Stage::Converted);
        assert_eq!(db.transitions_for("a@x.com").await.unwrap().len(), 3);
    }
}
