//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Booleans are stored as
//! INTEGER 0/1, timestamps as RFC 3339 text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::TimestampPolicy;
use crate::error::DatabaseError;
use crate::stage::Stage;
use crate::store::migrations;
use crate::store::records::{
    CampaignStats, Contact, DueFollowUp, FollowUp, Interaction, OutboundMessage, StageTransition,
};
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a single-value COUNT/SUM query.
    async fn scalar(&self, sql: &str) -> Result<i64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("scalar: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
            _ => Ok(0),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn opt_text(value: Option<&str>) -> libsql::Value {
    match value {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const CONTACT_COLUMNS: &str = "email, current_stage, stage_updated_at, created_at";

fn row_to_contact(row: &libsql::Row) -> Result<Contact, libsql::Error> {
    let email: String = row.get(0)?;
    let stage_str: String = row.get(1)?;
    let stage_updated: String = row.get(2)?;
    let created: String = row.get(3)?;

    Ok(Contact {
        email,
        current_stage: Stage::parse(&stage_str),
        stage_updated_at: parse_datetime(&stage_updated),
        created_at: parse_datetime(&created),
    })
}

const TRANSITION_COLUMNS: &str = "contact_email, from_stage, to_stage, changed_at";

fn row_to_transition(row: &libsql::Row) -> Result<StageTransition, libsql::Error> {
    let contact_email: String = row.get(0)?;
    let from_str: String = row.get(1)?;
    let to_str: String = row.get(2)?;
    let changed: String = row.get(3)?;

    Ok(StageTransition {
        contact_email,
        from_stage: Stage::parse(&from_str),
        to_stage: Stage::parse(&to_str),
        changed_at: parse_datetime(&changed),
    })
}

const OUTBOUND_COLUMNS: &str = "id, message_id, recipient, subject, content_hash, campaign, \
     sent_at, responded, responded_at, opened, opened_at, click_count, clicked_at, \
     delivered, delivered_at, failed, fail_reason";

fn row_to_outbound(row: &libsql::Row) -> Result<OutboundMessage, libsql::Error> {
    Ok(OutboundMessage {
        id: row.get(0)?,
        message_id: row.get(1)?,
        recipient: row.get(2)?,
        subject: row.get(3)?,
        content_hash: row.get(4)?,
        campaign: row.get::<String>(5).ok(),
        sent_at: parse_datetime(&row.get::<String>(6)?),
        responded: row.get::<i64>(7)? != 0,
        responded_at: parse_optional_datetime(row.get::<String>(8).ok()),
        opened: row.get::<i64>(9)? != 0,
        opened_at: parse_optional_datetime(row.get::<String>(10).ok()),
        click_count: row.get(11)?,
        clicked_at: parse_optional_datetime(row.get::<String>(12).ok()),
        delivered: row.get::<i64>(13)? != 0,
        delivered_at: parse_optional_datetime(row.get::<String>(14).ok()),
        failed: row.get::<i64>(15)? != 0,
        fail_reason: row.get::<String>(16).ok(),
    })
}

const FOLLOW_UP_COLUMNS: &str = "id, parent_id, sequence_number, scheduled_at, sent";

fn row_to_follow_up(row: &libsql::Row) -> Result<FollowUp, libsql::Error> {
    Ok(FollowUp {
        id: row.get(0)?,
        parent_id: row.get(1)?,
        sequence_number: row.get(2)?,
        scheduled_at: parse_datetime(&row.get::<String>(3)?),
        sent: row.get::<i64>(4)? != 0,
    })
}

// ── Database trait ──────────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Contacts ────────────────────────────────────────────────────

    async fn get_contact(&self, email: &str) -> Result<Option<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CONTACT_COLUMNS} FROM contacts WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_contact: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let contact = row_to_contact(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(contact))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_contact: {e}"))),
        }
    }

    async fn insert_contact(
        &self,
        email: &str,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO contacts (email, current_stage, stage_updated_at, created_at)
                 VALUES (?1, ?2, ?3, ?3)",
                params![email, stage.as_str(), now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_contact: {e}")))?;

        if changed > 0 {
            debug!(contact = %email, "Contact created");
        }
        Ok(changed > 0)
    }

    async fn apply_stage_change(
        &self,
        email: &str,
        from: Stage,
        to: Stage,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_stage_change begin: {e}")))?;

        tx.execute(
            "INSERT INTO stage_transitions (id, contact_email, from_stage, to_stage, changed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                Uuid::new_v4().to_string(),
                email,
                from.as_str(),
                to.as_str(),
                at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("apply_stage_change insert: {e}")))?;

        tx.execute(
            "UPDATE contacts SET current_stage = ?2, stage_updated_at = ?3 WHERE email = ?1",
            params![email, to.as_str(), at.to_rfc3339()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("apply_stage_change update: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_stage_change commit: {e}")))?;

        Ok(())
    }

    async fn latest_transition(
        &self,
        email: &str,
    ) -> Result<Option<StageTransition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRANSITION_COLUMNS} FROM stage_transitions
                     WHERE contact_email = ?1 ORDER BY changed_at DESC, rowid DESC LIMIT 1"
                ),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_transition: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let t = row_to_transition(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?;
                Ok(Some(t))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_transition: {e}"))),
        }
    }

    async fn transitions_for(&self, email: &str) -> Result<Vec<StageTransition>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRANSITION_COLUMNS} FROM stage_transitions
                     WHERE contact_email = ?1 ORDER BY changed_at DESC, rowid DESC"
                ),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transitions_for: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(
                row_to_transition(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(out)
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts ORDER BY stage_updated_at DESC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_contacts: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(
                row_to_contact(&row).map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(out)
    }

    // ── Outbound messages ───────────────────────────────────────────

    async fn insert_outbound(&self, msg: &OutboundMessage) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO outbound_messages
                    (id, message_id, recipient, subject, content_hash, campaign, sent_at,
                     responded, responded_at, opened, opened_at, click_count, clicked_at,
                     delivered, delivered_at, failed, fail_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, NULL, ?10, NULL, ?11, NULL, ?12, ?13)",
                params![
                    msg.id.as_str(),
                    msg.message_id.as_str(),
                    msg.recipient.as_str(),
                    msg.subject.as_str(),
                    msg.content_hash.as_str(),
                    opt_text(msg.campaign.as_deref()),
                    msg.sent_at.to_rfc3339(),
                    msg.responded as i64,
                    msg.opened as i64,
                    msg.click_count,
                    msg.delivered as i64,
                    msg.failed as i64,
                    opt_text(msg.fail_reason.as_deref()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_outbound: {e}")))?;

        debug!(id = %msg.id, recipient = %msg.recipient, "Outbound message persisted");
        Ok(())
    }

    async fn get_outbound(&self, id: &str) -> Result<Option<OutboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {OUTBOUND_COLUMNS} FROM outbound_messages WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_outbound: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_outbound(&row).map_err(|e| {
                DatabaseError::Query(format!("row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_outbound: {e}"))),
        }
    }

    async fn get_outbound_by_message_id(
        &self,
        message_id: &str,
    ) -> Result<Option<OutboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {OUTBOUND_COLUMNS} FROM outbound_messages WHERE message_id = ?1"),
                params![message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_outbound_by_message_id: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_outbound(&row).map_err(|e| {
                DatabaseError::Query(format!("row parse: {e}"))
            })?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!(
                "get_outbound_by_message_id: {e}"
            ))),
        }
    }

    async fn mark_responded(&self, id: &str, at: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE outbound_messages SET responded = 1, responded_at = ?2
                 WHERE id = ?1 AND responded = 0",
                params![id, at.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_responded: {e}")))?;
        Ok(changed > 0)
    }

    async fn mark_opened(
        &self,
        id: &str,
        at: DateTime<Utc>,
        policy: TimestampPolicy,
    ) -> Result<(), DatabaseError> {
        let sql = match policy {
            TimestampPolicy::FirstWins => {
                "UPDATE outbound_messages SET opened = 1,
                     opened_at = COALESCE(opened_at, ?2) WHERE id = ?1"
            }
            TimestampPolicy::LastWins => {
                "UPDATE outbound_messages SET opened = 1, opened_at = ?2 WHERE id = ?1"
            }
        };
        self.conn()
            .execute(sql, params![id, at.to_rfc3339()])
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_opened: {e}")))?;
        Ok(())
    }

    async fn record_click(
        &self,
        id: &str,
        at: DateTime<Utc>,
        policy: TimestampPolicy,
    ) -> Result<(), DatabaseError> {
        let sql = match policy {
            TimestampPolicy::FirstWins => {
                "UPDATE outbound_messages SET click_count = click_count + 1,
                     clicked_at = COALESCE(clicked_at, ?2) WHERE id = ?1"
            }
            TimestampPolicy::LastWins => {
                "UPDATE outbound_messages SET click_count = click_count + 1,
                     clicked_at = ?2 WHERE id = ?1"
            }
        };
        self.conn()
            .execute(sql, params![id, at.to_rfc3339()])
            .await
            .map_err(|e| DatabaseError::Query(format!("record_click: {e}")))?;
        Ok(())
    }

    async fn mark_delivered(
        &self,
        id: &str,
        at: DateTime<Utc>,
        policy: TimestampPolicy,
    ) -> Result<(), DatabaseError> {
        let sql = match policy {
            TimestampPolicy::FirstWins => {
                "UPDATE outbound_messages SET delivered = 1,
                     delivered_at = COALESCE(delivered_at, ?2) WHERE id = ?1"
            }
            TimestampPolicy::LastWins => {
                "UPDATE outbound_messages SET delivered = 1, delivered_at = ?2 WHERE id = ?1"
            }
        };
        self.conn()
            .execute(sql, params![id, at.to_rfc3339()])
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_delivered: {e}")))?;
        Ok(())
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE outbound_messages SET failed = 1, fail_reason = ?2 WHERE id = ?1",
                params![id, reason],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;
        Ok(())
    }

    async fn campaign_stats(&self) -> Result<CampaignStats, DatabaseError> {
        Ok(CampaignStats {
            contacts: self.scalar("SELECT COUNT(*) FROM contacts").await?,
            messages_sent: self.scalar("SELECT COUNT(*) FROM outbound_messages").await?,
            responses: self
                .scalar("SELECT COUNT(*) FROM outbound_messages WHERE responded = 1")
                .await?,
            opened: self
                .scalar("SELECT COUNT(*) FROM outbound_messages WHERE opened = 1")
                .await?,
            demos_scheduled: self
                .scalar("SELECT COUNT(*) FROM contacts WHERE current_stage = 'demo_scheduled'")
                .await?,
        })
    }

    // ── Follow-ups ──────────────────────────────────────────────────

    async fn insert_follow_ups(&self, items: &[FollowUp]) -> Result<(), DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_follow_ups begin: {e}")))?;

        for item in items {
            tx.execute(
                "INSERT INTO follow_ups (id, parent_id, sequence_number, scheduled_at, sent)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    item.id.as_str(),
                    item.parent_id.as_str(),
                    item.sequence_number,
                    item.scheduled_at.to_rfc3339(),
                    item.sent as i64,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_follow_ups: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_follow_ups commit: {e}")))?;
        Ok(())
    }

    async fn due_follow_ups(&self, now: DateTime<Utc>) -> Result<Vec<DueFollowUp>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT f.id, f.parent_id, f.sequence_number, m.recipient, m.campaign
                 FROM follow_ups f
                 JOIN outbound_messages m ON f.parent_id = m.id
                 WHERE f.sent = 0 AND f.scheduled_at <= ?1 AND m.responded = 0
                 ORDER BY f.scheduled_at ASC",
                params![now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("due_follow_ups: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(DueFollowUp {
                id: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                parent_id: row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                sequence_number: row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                recipient: row
                    .get(3)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                campaign: row.get::<String>(4).ok(),
            });
        }
        Ok(out)
    }

    async fn claim_follow_up(&self, id: &str) -> Result<bool, DatabaseError> {
        // Single conditional update: the unsent check wins races between
        // concurrent sweeps, the responded re-check closes the window
        // between selection and claim.
        let changed = self
            .conn()
            .execute(
                "UPDATE follow_ups SET sent = 1
                 WHERE id = ?1 AND sent = 0
                   AND (SELECT responded FROM outbound_messages
                        WHERE id = follow_ups.parent_id) = 0",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_follow_up: {e}")))?;
        Ok(changed > 0)
    }

    async fn release_follow_up(&self, id: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE follow_ups SET sent = 0 WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_follow_up: {e}")))?;
        Ok(())
    }

    async fn follow_ups_for(&self, parent_id: &str) -> Result<Vec<FollowUp>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {FOLLOW_UP_COLUMNS} FROM follow_ups
                     WHERE parent_id = ?1 ORDER BY sequence_number ASC"
                ),
                params![parent_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("follow_ups_for: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(
                row_to_follow_up(&row)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
            );
        }
        Ok(out)
    }

    // ── Interactions ────────────────────────────────────────────────

    async fn record_interaction(
        &self,
        contact_email: &str,
        kind: &str,
        content: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO interactions (contact_email, kind, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![contact_email, kind, content, at.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_interaction: {e}")))?;
        Ok(changed > 0)
    }

    async fn interactions_for(&self, email: &str) -> Result<Vec<Interaction>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT contact_email, kind, content, created_at FROM interactions
                 WHERE contact_email = ?1 ORDER BY created_at DESC, id DESC",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("interactions_for: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push(Interaction {
                contact_email: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                kind: row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                content: row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                created_at: parse_datetime(
                    &row.get::<String>(3)
                        .map_err(|e| DatabaseError::Query(format!("row parse: {e}")))?,
                ),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn backend() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn message(id: &str, recipient: &str) -> OutboundMessage {
        OutboundMessage::new(
            id,
            format!("{id}@outreach.example"),
            recipient,
            "Modernize your practice",
            "<p>hello</p>",
            Some("practice-automation"),
            Utc::now(),
        )
    }

    // ── Contacts ────────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_contact() {
        let db = backend().await;
        let now = Utc::now();

        assert!(db.insert_contact("a@x.com", Stage::New, now).await.unwrap());
        let contact = db.get_contact("a@x.com").await.unwrap().unwrap();
        assert_eq!(contact.email, "a@x.com");
        assert_eq!(contact.current_stage, Stage::New);
    }

    #[tokio::test]
    async fn duplicate_contact_insert_is_absorbed() {
        let db = backend().await;
        let now = Utc::now();

        assert!(db.insert_contact("a@x.com", Stage::New, now).await.unwrap());
        // Second insert is the expected concurrency outcome, not an error
        assert!(
            !db.insert_contact("a@x.com", Stage::Interested, now)
                .await
                .unwrap()
        );

        // Original row untouched
        let contact = db.get_contact("a@x.com").await.unwrap().unwrap();
        assert_eq!(contact.current_stage, Stage::New);
    }

    #[tokio::test]
    async fn stage_change_writes_history_and_updates_contact() {
        let db = backend().await;
        let now = Utc::now();
        db.insert_contact("a@x.com", Stage::New, now).await.unwrap();

        db.apply_stage_change("a@x.com", Stage::New, Stage::Interested, now)
            .await
            .unwrap();

        let contact = db.get_contact("a@x.com").await.unwrap().unwrap();
        assert_eq!(contact.current_stage, Stage::Interested);

        let latest = db.latest_transition("a@x.com").await.unwrap().unwrap();
        assert_eq!(latest.from_stage, Stage::New);
        assert_eq!(latest.to_stage, Stage::Interested);
    }

    // ── Outbound messages ───────────────────────────────────────────

    #[tokio::test]
    async fn outbound_round_trip() {
        let db = backend().await;
        let msg = message("t-1", "dr@clinic.example");
        db.insert_outbound(&msg).await.unwrap();

        let loaded = db.get_outbound("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.recipient, "dr@clinic.example");
        assert_eq!(loaded.message_id, "t-1@outreach.example");
        assert!(!loaded.responded);
        assert_eq!(loaded.click_count, 0);

        let by_mid = db
            .get_outbound_by_message_id("t-1@outreach.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_mid.id, "t-1");
    }

    #[tokio::test]
    async fn mark_responded_is_idempotent() {
        let db = backend().await;
        db.insert_outbound(&message("t-1", "a@x.com")).await.unwrap();

        let first = db.mark_responded("t-1", Utc::now()).await.unwrap();
        let first_at = db
            .get_outbound("t-1")
            .await
            .unwrap()
            .unwrap()
            .responded_at
            .unwrap();

        let second = db
            .mark_responded("t-1", Utc::now() + Duration::hours(1))
            .await
            .unwrap();

        assert!(first);
        assert!(!second);

        let loaded = db.get_outbound("t-1").await.unwrap().unwrap();
        assert!(loaded.responded);
        assert_eq!(loaded.responded_at.unwrap(), first_at);
    }

    #[tokio::test]
    async fn opened_first_wins_keeps_earliest_timestamp() {
        let db = backend().await;
        db.insert_outbound(&message("t-1", "a@x.com")).await.unwrap();

        let early = Utc::now();
        let late = early + Duration::hours(3);

        db.mark_opened("t-1", early, TimestampPolicy::FirstWins)
            .await
            .unwrap();
        db.mark_opened("t-1", late, TimestampPolicy::FirstWins)
            .await
            .unwrap();

        let loaded = db.get_outbound("t-1").await.unwrap().unwrap();
        assert!(loaded.opened);
        assert_eq!(loaded.opened_at.unwrap(), early);
    }

    #[tokio::test]
    async fn opened_last_wins_overwrites_timestamp() {
        let db = backend().await;
        db.insert_outbound(&message("t-1", "a@x.com")).await.unwrap();

        let early = Utc::now();
        let late = early + Duration::hours(3);

        db.mark_opened("t-1", early, TimestampPolicy::LastWins)
            .await
            .unwrap();
        db.mark_opened("t-1", late, TimestampPolicy::LastWins)
            .await
            .unwrap();

        let loaded = db.get_outbound("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.opened_at.unwrap(), late);
    }

    #[tokio::test]
    async fn clicks_accumulate() {
        let db = backend().await;
        db.insert_outbound(&message("t-1", "a@x.com")).await.unwrap();

        let now = Utc::now();
        db.record_click("t-1", now, TimestampPolicy::FirstWins)
            .await
            .unwrap();
        db.record_click("t-1", now + Duration::minutes(5), TimestampPolicy::FirstWins)
            .await
            .unwrap();

        let loaded = db.get_outbound("t-1").await.unwrap().unwrap();
        assert_eq!(loaded.click_count, 2);
        assert_eq!(loaded.clicked_at.unwrap(), now);
    }

    #[tokio::test]
    async fn failed_records_reason() {
        let db = backend().await;
        db.insert_outbound(&message("t-1", "a@x.com")).await.unwrap();

        db.mark_failed("t-1", "mailbox full").await.unwrap();

        let loaded = db.get_outbound("t-1").await.unwrap().unwrap();
        assert!(loaded.failed);
        assert_eq!(loaded.fail_reason.as_deref(), Some("mailbox full"));
    }

    // ── Follow-ups ──────────────────────────────────────────────────

    async fn seed_follow_up(db: &LibSqlBackend, parent: &str, due_in_days: i64) -> String {
        db.insert_outbound(&message(parent, "a@x.com")).await.unwrap();
        let fu = FollowUp {
            id: format!("fu-{parent}"),
            parent_id: parent.to_string(),
            sequence_number: 3,
            scheduled_at: Utc::now() + Duration::days(due_in_days),
            sent: false,
        };
        db.insert_follow_ups(std::slice::from_ref(&fu)).await.unwrap();
        fu.id
    }

    #[tokio::test]
    async fn cadence_insert_is_atomic_and_ordered() {
        let db = backend().await;
        db.insert_outbound(&message("t-1", "a@x.com")).await.unwrap();

        let sent_at = Utc::now();
        let cadence: Vec<FollowUp> = [3_i64, 7, 14]
            .iter()
            .map(|days| FollowUp {
                id: format!("fu-{days}"),
                parent_id: "t-1".to_string(),
                sequence_number: *days,
                scheduled_at: sent_at + Duration::days(*days),
                sent: false,
            })
            .collect();
        db.insert_follow_ups(&cadence).await.unwrap();

        let loaded = db.follow_ups_for("t-1").await.unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(
            loaded.iter().map(|f| f.sequence_number).collect::<Vec<_>>(),
            vec![3, 7, 14]
        );
        assert!(loaded.iter().all(|f| !f.sent));
    }

    #[tokio::test]
    async fn due_selection_respects_schedule_and_response() {
        let db = backend().await;
        let due = seed_follow_up(&db, "t-due", -1).await;
        let _future = seed_follow_up(&db, "t-future", 5).await;
        let responded = seed_follow_up(&db, "t-responded", -1).await;
        db.mark_responded("t-responded", Utc::now()).await.unwrap();

        let found = db.due_follow_ups(Utc::now()).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec![due.as_str()]);
        let _ = responded;
    }

    #[tokio::test]
    async fn claim_succeeds_exactly_once() {
        let db = backend().await;
        let id = seed_follow_up(&db, "t-1", -1).await;

        assert!(db.claim_follow_up(&id).await.unwrap());
        assert!(!db.claim_follow_up(&id).await.unwrap());
    }

    #[tokio::test]
    async fn claim_refused_when_parent_responded() {
        let db = backend().await;
        let id = seed_follow_up(&db, "t-1", -1).await;
        db.mark_responded("t-1", Utc::now()).await.unwrap();

        assert!(!db.claim_follow_up(&id).await.unwrap());
    }

    #[tokio::test]
    async fn release_allows_reclaim() {
        let db = backend().await;
        let id = seed_follow_up(&db, "t-1", -1).await;

        assert!(db.claim_follow_up(&id).await.unwrap());
        db.release_follow_up(&id).await.unwrap();
        assert!(db.claim_follow_up(&id).await.unwrap());
    }

    // ── Interactions ────────────────────────────────────────────────

    #[tokio::test]
    async fn interaction_dedup_absorbs_replays() {
        let db = backend().await;
        let now = Utc::now();

        let first = db
            .record_interaction("a@x.com", "inbound_reply", "msg-1: hello", now)
            .await
            .unwrap();
        let replay = db
            .record_interaction(
                "a@x.com",
                "inbound_reply",
                "msg-1: hello",
                now + Duration::minutes(1),
            )
            .await
            .unwrap();

        assert!(first);
        assert!(!replay);
        assert_eq!(db.interactions_for("a@x.com").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_interactions_all_recorded() {
        let db = backend().await;
        let now = Utc::now();

        db.record_interaction("a@x.com", "sent_email", "subject one", now)
            .await
            .unwrap();
        db.record_interaction("a@x.com", "inbound_reply", "subject one", now)
            .await
            .unwrap();
        db.record_interaction("a@x.com", "sent_email", "subject two", now)
            .await
            .unwrap();

        assert_eq!(db.interactions_for("a@x.com").await.unwrap().len(), 3);
    }

    // ── Stats ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn stats_count_the_basics() {
        let db = backend().await;
        let now = Utc::now();

        db.insert_contact("a@x.com", Stage::New, now).await.unwrap();
        db.apply_stage_change("a@x.com", Stage::New, Stage::DemoScheduled, now)
            .await
            .unwrap();
        db.insert_outbound(&message("t-1", "a@x.com")).await.unwrap();
        db.insert_outbound(&message("t-2", "b@x.com")).await.unwrap();
        db.mark_responded("t-1", now).await.unwrap();

        let stats = db.campaign_stats().await.unwrap();
        assert_eq!(stats.contacts, 1);
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.responses, 1);
        assert_eq!(stats.demos_scheduled, 1);
    }
}
