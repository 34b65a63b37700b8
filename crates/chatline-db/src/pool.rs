//! SQLite pool for the chat store.
//!
//! Every connection handed out by the pool has foreign keys on (messages must
//! point at existing users), a busy timeout so concurrent message inserts
//! queue instead of failing, and, for file databases, WAL journaling with the
//! configured `synchronous` level.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Path that selects a private in-memory database.
pub const IN_MEMORY: &str = ":memory:";

/// SQLite `synchronous` level applied to file databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Synchronous {
    Off,
    /// Durable across application crashes; a power loss may drop the last
    /// committed messages. The usual pairing with WAL.
    #[default]
    Normal,
    Full,
}

impl Synchronous {
    fn pragma_value(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Normal => "NORMAL",
            Self::Full => "FULL",
        }
    }
}

impl fmt::Display for Synchronous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pragma_value().to_ascii_lowercase())
    }
}

impl FromStr for Synchronous {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "normal" => Ok(Self::Normal),
            "full" => Ok(Self::Full),
            other => Err(PoolError::InvalidSettings(format!(
                "unknown synchronous level '{other}', expected off, normal or full"
            ))),
        }
    }
}

/// Connection and pool tunables for the chat store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbRuntimeSettings {
    /// How long a connection waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Upper bound on pooled connections. Forced to 1 for in-memory databases.
    pub pool_max_size: u32,
    /// How long a handler waits to check out a connection, in milliseconds.
    pub connection_timeout_ms: u64,
    pub synchronous: Synchronous,
}

impl Default for DbRuntimeSettings {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pool_max_size: 8,
            connection_timeout_ms: 5_000,
            synchronous: Synchronous::Normal,
        }
    }
}

/// Pool of SQLite connections shared by HTTP handlers and the message store.
pub type DbPool = Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to create database connection pool: {0}")]
    PoolInit(#[from] r2d2::Error),

    #[error("invalid database settings: {0}")]
    InvalidSettings(String),
}

/// Opens the chat store at `db_path`.
///
/// `:memory:` gets a single-connection pool: each SQLite in-memory connection
/// is its own database, so a wider pool would hand out connections that never
/// saw the migrations.
///
/// # Errors
///
/// `PoolError::InvalidSettings` for a zero pool size, `PoolError::PoolInit`
/// when the first connections cannot be opened or configured.
pub fn create_pool(db_path: &str, settings: DbRuntimeSettings) -> Result<DbPool, PoolError> {
    if settings.pool_max_size == 0 {
        return Err(PoolError::InvalidSettings(
            "pool_max_size must be at least 1".to_string(),
        ));
    }

    let in_memory = db_path == IN_MEMORY;
    let (manager, max_size) = if in_memory {
        (SqliteConnectionManager::memory(), 1)
    } else {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        (
            SqliteConnectionManager::file(db_path).with_flags(flags),
            settings.pool_max_size,
        )
    };
    let manager = manager.with_init(move |conn| prepare_connection(conn, &settings, in_memory));

    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_millis(settings.connection_timeout_ms))
        .build(manager)?;

    tracing::debug!(
        path = db_path,
        pool_max_size = max_size,
        synchronous = %settings.synchronous,
        "database pool created"
    );

    Ok(pool)
}

fn prepare_connection(
    conn: &mut Connection,
    settings: &DbRuntimeSettings,
    in_memory: bool,
) -> rusqlite::Result<()> {
    if !in_memory {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!("database refused WAL journal mode, got {mode}")),
            ));
        }
        conn.pragma_update(None, "synchronous", settings.synchronous.pragma_value())?;
    }
    conn.pragma_update(None, "foreign_keys", true)?;
    conn.busy_timeout(Duration::from_millis(settings.busy_timeout_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pragma_i64(conn: &Connection, name: &str) -> i64 {
        conn.pragma_query_value(None, name, |row| row.get(0))
            .unwrap_or_else(|e| panic!("should read pragma {name}: {e}"))
    }

    #[test]
    fn file_pool_uses_wal_and_requested_sync_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let settings = DbRuntimeSettings {
            busy_timeout_ms: 2_500,
            pool_max_size: 3,
            connection_timeout_ms: 750,
            synchronous: Synchronous::Full,
        };

        let pool = create_pool(path.to_str().unwrap(), settings).expect("pool should open");
        assert_eq!(pool.max_size(), 3);
        assert_eq!(pool.connection_timeout(), Duration::from_millis(750));

        let conn = pool.get().unwrap();
        let mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");
        assert_eq!(pragma_i64(&conn, "foreign_keys"), 1);
        assert_eq!(pragma_i64(&conn, "busy_timeout"), 2_500);
        // FULL = 2
        assert_eq!(pragma_i64(&conn, "synchronous"), 2);
    }

    #[test]
    fn in_memory_pool_is_one_shared_connection() {
        let pool = create_pool(IN_MEMORY, DbRuntimeSettings::default()).unwrap();
        assert_eq!(pool.max_size(), 1);

        pool.get()
            .unwrap()
            .execute_batch("CREATE TABLE note (body TEXT); INSERT INTO note VALUES ('kept');")
            .unwrap();

        // A later checkout sees the same database.
        let body: String = pool
            .get()
            .unwrap()
            .query_row("SELECT body FROM note", [], |row| row.get(0))
            .unwrap();
        assert_eq!(body, "kept");
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let settings = DbRuntimeSettings {
            pool_max_size: 0,
            ..DbRuntimeSettings::default()
        };
        let err = create_pool(IN_MEMORY, settings).unwrap_err();
        assert!(matches!(err, PoolError::InvalidSettings(_)));
    }

    #[test]
    fn synchronous_levels_parse_case_insensitively() {
        assert_eq!("Normal".parse::<Synchronous>().unwrap(), Synchronous::Normal);
        assert_eq!(" full ".parse::<Synchronous>().unwrap(), Synchronous::Full);
        assert_eq!("off".parse::<Synchronous>().unwrap(), Synchronous::Off);
        assert!("extra".parse::<Synchronous>().is_err());
        assert_eq!(Synchronous::Normal.to_string(), "normal");
    }
}
