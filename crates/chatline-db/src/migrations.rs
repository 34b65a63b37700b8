//! Versioned schema for the chat store.
//!
//! Each migration is a numbered SQL file compiled into the binary. The
//! `_chatline_schema` table records which versions a database has seen; a
//! migration and its record commit in one transaction.

use rusqlite::Connection;
use thiserror::Error;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "users",
        sql: include_str!("migrations/001_users.sql"),
    },
    Migration {
        version: 2,
        name: "messages",
        sql: include_str!("migrations/002_messages.sql"),
    },
];

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration {version} ({name}) failed: {source}")]
    ExecutionFailed {
        version: u32,
        name: &'static str,
        source: rusqlite::Error,
    },

    #[error("failed to read schema version: {0}")]
    StateQuery(#[source] rusqlite::Error),

    /// The database was migrated by a build that knows more migrations.
    #[error("database schema version {found} is newer than the supported version {supported}")]
    NewerSchema { found: u32, supported: u32 },
}

/// What a migration run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Names of the migrations applied by this run, in order.
    pub applied: Vec<&'static str>,
    /// Schema version after the run.
    pub version: u32,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Brings the schema up to the latest version.
///
/// # Errors
///
/// `MigrationError::NewerSchema` when the database is ahead of this build,
/// otherwise the first failing migration. Earlier migrations of the run stay
/// committed.
pub fn run_migrations(conn: &Connection) -> Result<MigrationReport, MigrationError> {
    apply(conn, MIGRATIONS)
}

/// Latest version recorded in the database, 0 for a fresh one.
pub fn schema_version(conn: &Connection) -> Result<u32, MigrationError> {
    ensure_schema_table(conn)?;
    current_version(conn)
}

fn ensure_schema_table(conn: &Connection) -> Result<(), MigrationError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _chatline_schema (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
        );",
    )
    .map_err(MigrationError::StateQuery)
}

fn current_version(conn: &Connection) -> Result<u32, MigrationError> {
    conn.query_row("SELECT MAX(version) FROM _chatline_schema", [], |row| {
        row.get::<_, Option<u32>>(0)
    })
    .map(|v| v.unwrap_or(0))
    .map_err(MigrationError::StateQuery)
}

fn apply(conn: &Connection, migrations: &[Migration]) -> Result<MigrationReport, MigrationError> {
    ensure_schema_table(conn)?;

    let supported = migrations.last().map_or(0, |m| m.version);
    let mut version = current_version(conn)?;
    if version > supported {
        return Err(MigrationError::NewerSchema {
            found: version,
            supported,
        });
    }

    let mut applied = Vec::new();
    for migration in migrations.iter().filter(move |m| m.version > version) {
        let failed = |source| MigrationError::ExecutionFailed {
            version: migration.version,
            name: migration.name,
            source,
        };

        let tx = conn.unchecked_transaction().map_err(failed)?;
        tx.execute_batch(migration.sql).map_err(failed)?;
        tx.execute(
            "INSERT INTO _chatline_schema (version, name) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.name],
        )
        .map_err(failed)?;
        tx.commit().map_err(failed)?;

        tracing::info!(
            version = migration.version,
            migration = migration.name,
            "applied migration"
        );
        version = migration.version;
        applied.push(migration.name);
    }

    Ok(MigrationReport { applied, version })
}
