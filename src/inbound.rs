//! Inbound signal processing.
//!
//! Both the mailbox poller and the delivery provider's inbound webhook
//! produce `InboundSignal`s; this is the single path that marks replies,
//! classifies them, and drives the stage state machine. The interaction
//! log's uniqueness constraint plus the no-op transition rule make the
//! whole path safe to re-run on the same message.

use std::sync::Arc;

use tracing::{debug, info};

use crate::classify::ResponseClassifier;
use crate::clock::Clock;
use crate::error::Result;
use crate::stage::{Stage, StageTracker};
use crate::store::Database;

/// A decoded inbound message, transient — consumed by the state machine
/// and logged as an interaction for audit.
#[derive(Debug, Clone)]
pub struct InboundSignal {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub from: String,
    pub subject: String,
    pub body: String,
}

/// Strip whitespace and RFC 5322 angle brackets from a Message-ID so
/// header variants compare equal.
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

/// Applies one inbound signal: reply marking → classification → stage
/// transition, with an audit interaction on the way in.
pub struct SignalProcessor {
    db: Arc<dyn Database>,
    classifier: ResponseClassifier,
    tracker: Arc<StageTracker>,
    clock: Arc<dyn Clock>,
}

impl SignalProcessor {
    pub fn new(
        db: Arc<dyn Database>,
        classifier: ResponseClassifier,
        tracker: Arc<StageTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            classifier,
            tracker,
            clock,
        }
    }

    /// Process one signal. Returns the stage label applied, if any.
    pub async fn process(&self, signal: &InboundSignal) -> Result<Option<Stage>> {
        let now = self.clock.now();

        // Audit trail first; the uniqueness constraint absorbs replays
        // from overlapping poll cycles.
        let audit_content = format!("[{}] {}", signal.message_id, signal.subject);
        let fresh = self
            .db
            .record_interaction(&signal.from, "inbound_reply", &audit_content, now)
            .await?;
        if !fresh {
            debug!(message_id = %signal.message_id, "Signal seen before, reapplying idempotently");
        }

        // A reply to a tracked outbound message flips its responded flag
        let mut tracked_reply = false;
        if let Some(ref in_reply_to) = signal.in_reply_to {
            let reference = normalize_message_id(in_reply_to);
            if let Some(parent) = self.db.get_outbound_by_message_id(&reference).await? {
                tracked_reply = true;
                if self.db.mark_responded(&parent.id, now).await? {
                    info!(
                        message = %parent.id,
                        from = %signal.from,
                        "Outbound message responded to"
                    );
                }
            } else {
                debug!(reference = %reference, "Reply references unknown message");
            }
        }

        let label = self
            .classifier
            .classify(&signal.subject, &signal.body, tracked_reply);

        if let Some(stage) = label {
            self.tracker.transition(&signal.from, stage).await?;
        }

        Ok(label)
    }
}
