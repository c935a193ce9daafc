//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS contacts (
                email TEXT PRIMARY KEY,
                current_stage TEXT NOT NULL DEFAULT 'new',
                stage_updated_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_contacts_stage ON contacts(current_stage);
            CREATE INDEX IF NOT EXISTS idx_contacts_updated ON contacts(stage_updated_at);

            CREATE TABLE IF NOT EXISTS stage_transitions (
                id TEXT PRIMARY KEY,
                contact_email TEXT NOT NULL REFERENCES contacts(email),
                from_stage TEXT NOT NULL,
                to_stage TEXT NOT NULL,
                changed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_transitions_contact
                ON stage_transitions(contact_email, changed_at);

            CREATE TABLE IF NOT EXISTS outbound_messages (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL UNIQUE,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                content_hash TEXT NOT NULL,
                campaign TEXT,
                sent_at TEXT NOT NULL,
                responded INTEGER NOT NULL DEFAULT 0,
                responded_at TEXT,
                opened INTEGER NOT NULL DEFAULT 0,
                opened_at TEXT,
                click_count INTEGER NOT NULL DEFAULT 0,
                clicked_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_outbound_recipient ON outbound_messages(recipient);
            CREATE INDEX IF NOT EXISTS idx_outbound_message_id ON outbound_messages(message_id);

            CREATE TABLE IF NOT EXISTS follow_ups (
                id TEXT PRIMARY KEY,
                parent_id TEXT NOT NULL REFERENCES outbound_messages(id),
                sequence_number INTEGER NOT NULL,
                scheduled_at TEXT NOT NULL,
                sent INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_follow_ups_due ON follow_ups(sent, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_follow_ups_parent ON follow_ups(parent_id);

            CREATE TABLE IF NOT EXISTS interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                contact_email TEXT NOT NULL,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (contact_email, kind, content)
            );
            CREATE INDEX IF NOT EXISTS idx_interactions_contact
                ON interactions(contact_email, created_at);
        "#,
    },
    Migration {
        version: 2,
        name: "delivery_status",
        sql: r#"
            ALTER TABLE outbound_messages ADD COLUMN delivered INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE outbound_messages ADD COLUMN delivered_at TEXT;
            ALTER TABLE outbound_messages ADD COLUMN failed INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE outbound_messages ADD COLUMN fail_reason TEXT;
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    tracing::debug!("Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
