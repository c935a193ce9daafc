//! The inbox poll worker.
//!
//! Idempotence under repeated polling lives downstream: the interaction
//! log's uniqueness constraint and the no-op transition rule absorb the
//! duplicates another poller instance on the same mailbox would cause,
//! so no exclusive leasing is attempted here.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ChannelError;
use crate::inbound::SignalProcessor;
use crate::mailbox::{MailboxTransport, decode_signal};

/// Fetches unseen mail and routes each message through the signal path.
pub struct InboxPoller {
    transport: Arc<dyn MailboxTransport>,
    processor: Arc<SignalProcessor>,
}

impl InboxPoller {
    pub fn new(transport: Arc<dyn MailboxTransport>, processor: Arc<SignalProcessor>) -> Self {
        Self {
            transport,
            processor,
        }
    }

    /// One poll cycle. Returns the number of messages processed.
    ///
    /// A search failure bubbles up so the loop can back off; a single
    /// unfetchable, undecodable, or unprocessable message is skipped and
    /// the rest of the batch continues.
    pub async fn poll_once(&self) -> Result<usize, ChannelError> {
        let ids = self.transport.search_unseen().await?;
        if ids.is_empty() {
            return Ok(0);
        }
        debug!(count = ids.len(), "Unseen messages found");

        let mut processed = 0;
        for id in ids {
            let raw = match self.transport.fetch(&id).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(id = %id, error = %e, "Fetch failed, skipping message");
                    continue;
                }
            };

            let Some(signal) = decode_signal(&raw) else {
                warn!(id = %id, "Undecodable message skipped");
                continue;
            };

            match self.processor.process(&signal).await {
                Ok(label) => {
                    processed += 1;
                    if let Some(stage) = label {
                        debug!(from = %signal.from, stage = %stage, "Inbound message classified");
                    }
                }
                Err(e) => {
                    warn!(from = %signal.from, error = %e, "Signal processing failed");
                }
            }
        }
        Ok(processed)
    }
}

/// Spawn the poll loop. Transport errors trigger exponential backoff
/// with jitter; the loop retries indefinitely and never exits on its
/// own. Returns the handle and a shutdown flag.
pub fn spawn_inbox_poller(
    poller: Arc<InboxPoller>,
    interval_secs: u64,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!("Inbox poller started — polling every {interval_secs}s");
        let mut tick = tokio::time::interval(Duration::from_secs(interval_secs));
        let mut failures: u32 = 0;

        loop {
            tick.tick().await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Inbox poller shutting down");
                return;
            }

            match poller.poll_once().await {
                Ok(_) => failures = 0,
                Err(e) => {
                    failures += 1;
                    let delay = backoff_delay(failures);
                    warn!(
                        error = %e,
                        failures,
                        delay_secs = delay.as_secs(),
                        "Mailbox poll failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });

    (handle, shutdown_flag)
}

/// Exponential backoff with jitter, capped so a long outage still
/// retries every few minutes. The jitter keeps several pollers sharing
/// a mailbox from hammering the server in lockstep.
fn backoff_delay(failures: u32) -> Duration {
    let base = 10_u64 << failures.min(6).saturating_sub(1);
    let jitter = rand::thread_rng().gen_range(0..=base / 2);
    Duration::from_secs(base + jitter)
}
