use std::path::Path;

use migration_engine_core::{EngineError, Migration, Version, VersionId};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info};

mod runner;

pub use runner::{AppliedStep, ResetReport, RunReport, Runner};

pub const VERSION_TABLE: &str = "engine_version";
pub const LEDGER_TABLE: &str = "engine_applied_migrations";

const CREATE_VERSION_STORE_SQL: &str = r"
CREATE TABLE IF NOT EXISTS engine_version (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  version_num TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS engine_applied_migrations (
  version INTEGER PRIMARY KEY,
  label TEXT NOT NULL,
  checksum TEXT NOT NULL,
  applied_at TEXT NOT NULL
);
";

/// Target database plus the version store living inside it.
///
/// The current version is never cached: every read goes to the
/// `engine_version` row, since another process may have moved it.
pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppliedRecord {
    pub version: Version,
    pub label: String,
    pub checksum: String,
    pub applied_at: String,
}

impl SqliteStore {
    /// Open a SQLite database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreIo`] when the database cannot be opened or
    /// pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let conn = Connection::open(path).map_err(|err| {
            EngineError::StoreIo(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(store_io("failed to configure sqlite pragmas"))?;

        debug!(path = %path.display(), "opened sqlite database");
        Ok(Self { conn })
    }

    /// Open for reading only: nothing is created and no pragma is persisted.
    ///
    /// A missing database file reads as an empty database, so the current
    /// version is base and the ledger is empty.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreIo`] when an existing database cannot be
    /// opened.
    pub fn open_read_only(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            debug!(path = %path.display(), "database does not exist; reading as empty");
            let conn = Connection::open_in_memory()
                .map_err(store_io("failed to open empty in-memory database"))?;
            return Ok(Self { conn });
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| {
            EngineError::StoreIo(format!(
                "failed to open sqlite database at {} read-only: {err}",
                path.display()
            ))
        })?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))
            .map_err(store_io("failed to set busy timeout"))?;

        debug!(path = %path.display(), "opened sqlite database read-only");
        Ok(Self { conn })
    }

    /// Create the version store tables. Safe to call repeatedly; returns
    /// `true` only when this call created them.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreIo`] when the tables cannot be created.
    pub fn init(&self) -> Result<bool, EngineError> {
        let existed = self.is_initialized()?;
        self.conn
            .execute_batch(CREATE_VERSION_STORE_SQL)
            .map_err(store_io("failed to create version store tables"))?;

        if !existed {
            info!(table = VERSION_TABLE, "initialized version store");
        }
        Ok(!existed)
    }

    /// # Errors
    /// Returns [`EngineError::StoreIo`] when the schema cannot be inspected.
    pub fn is_initialized(&self) -> Result<bool, EngineError> {
        Ok(table_exists(&self.conn, VERSION_TABLE)? && table_exists(&self.conn, LEDGER_TABLE)?)
    }

    /// Read the current version. A database without the version store, or
    /// with an empty one, is at base.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreIo`] when the row cannot be read or holds
    /// an unrecognised value.
    pub fn read_current(&self) -> Result<VersionId, EngineError> {
        if !table_exists(&self.conn, VERSION_TABLE)? {
            return Ok(VersionId::Base);
        }

        let raw = self
            .conn
            .query_row("SELECT version_num FROM engine_version WHERE id = 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .map_err(store_io("failed to read current version"))?;

        match raw {
            None => Ok(VersionId::Base),
            Some(raw) => VersionId::parse(&raw).ok_or_else(|| {
                EngineError::StoreIo(format!("unrecognised version_num `{raw}` in {VERSION_TABLE}"))
            }),
        }
    }

    /// Applied-migration ledger in ascending version order.
    ///
    /// # Errors
    /// Returns [`EngineError::StoreIo`] when the ledger cannot be read.
    pub fn applied_migrations(&self) -> Result<Vec<AppliedRecord>, EngineError> {
        if !table_exists(&self.conn, LEDGER_TABLE)? {
            return Ok(Vec::new());
        }

        let mut stmt = self
            .conn
            .prepare(
                "SELECT version, label, checksum, applied_at
                 FROM engine_applied_migrations
                 ORDER BY version ASC",
            )
            .map_err(store_io("failed to prepare ledger query"))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(store_io("failed to read ledger"))?;

        let mut records = Vec::new();
        for row in rows {
            let (version, label, checksum, applied_at) =
                row.map_err(store_io("failed to read ledger row"))?;
            let version = u64::try_from(version).map_err(|_| {
                EngineError::StoreIo(format!("negative version {version} in {LEDGER_TABLE}"))
            })?;
            records.push(AppliedRecord { version: Version(version), label, checksum, applied_at });
        }
        Ok(records)
    }
}

/// Upsert the singleton current-version row. Callers pass the open
/// transaction of the step being recorded.
fn write_current(conn: &Connection, version: VersionId) -> Result<(), EngineError> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT INTO engine_version(id, version_num, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET
           version_num = excluded.version_num,
           updated_at = excluded.updated_at",
        params![version.to_string(), now],
    )
    .map_err(store_io("failed to write current version"))?;
    Ok(())
}

fn record_applied(conn: &Connection, migration: &Migration) -> Result<(), EngineError> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR REPLACE INTO engine_applied_migrations(version, label, checksum, applied_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![sql_version(migration.version)?, migration.label, migration.checksum, now],
    )
    .map_err(store_io("failed to record applied migration"))?;
    Ok(())
}

fn forget_applied(conn: &Connection, version: Version) -> Result<(), EngineError> {
    conn.execute(
        "DELETE FROM engine_applied_migrations WHERE version = ?1",
        params![sql_version(version)?],
    )
    .map_err(store_io("failed to remove applied migration"))?;
    Ok(())
}

fn clear_applied(conn: &Connection) -> Result<(), EngineError> {
    conn.execute("DELETE FROM engine_applied_migrations", [])
        .map_err(store_io("failed to clear applied migrations"))?;
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, EngineError> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .map_err(|err| {
            EngineError::StoreIo(format!("failed to check if table exists: {table_name}: {err}"))
        })?;
    Ok(exists == 1)
}

fn sql_version(version: Version) -> Result<i64, EngineError> {
    i64::try_from(version.0)
        .map_err(|_| EngineError::StoreIo(format!("version {version} does not fit in INTEGER")))
}

fn store_io(context: &'static str) -> impl Fn(rusqlite::Error) -> EngineError {
    move |err| EngineError::StoreIo(format!("{context}: {err}"))
}

fn now_rfc3339() -> Result<String, EngineError> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| EngineError::StoreIo(format!("failed to format RFC3339 timestamp: {err}")))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::{anyhow, Result};

    use super::*;

    fn unique_db_path(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
            .as_nanos();
        std::env::temp_dir().join(format!("{prefix}-{now}.sqlite3"))
    }

    #[test]
    fn fresh_database_reads_base_without_creating_tables() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;

        assert_eq!(store.read_current()?, VersionId::Base);
        assert!(store.applied_migrations()?.is_empty());
        assert!(!store.is_initialized()?);
        Ok(())
    }

    #[test]
    fn init_is_idempotent() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;

        assert!(store.init()?);
        assert!(!store.init()?);
        assert!(store.is_initialized()?);
        assert_eq!(store.read_current()?, VersionId::Base);
        Ok(())
    }

    #[test]
    fn write_current_upserts_the_singleton_row() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.init()?;

        write_current(&store.conn, VersionId::At(Version(2)))?;
        write_current(&store.conn, VersionId::At(Version(3)))?;
        assert_eq!(store.read_current()?, VersionId::At(Version(3)));

        write_current(&store.conn, VersionId::Base)?;
        assert_eq!(store.read_current()?, VersionId::Base);

        let rows =
            store.conn.query_row("SELECT COUNT(*) FROM engine_version", [], |row| row.get::<_, i64>(0))?;
        assert_eq!(rows, 1);
        Ok(())
    }

    #[test]
    fn singleton_constraint_rejects_a_second_row() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.init()?;

        let result = store.conn.execute(
            "INSERT INTO engine_version(id, version_num, updated_at) VALUES (2, 'base', 'now')",
            [],
        );
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn unrecognised_stored_value_is_a_store_error() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.init()?;
        store.conn.execute(
            "INSERT INTO engine_version(id, version_num, updated_at) VALUES (1, 'abc123', 'now')",
            [],
        )?;

        match store.read_current() {
            Err(EngineError::StoreIo(message)) => assert!(message.contains("abc123")),
            other => return Err(anyhow!("expected StoreIo error, got {other:?}")),
        }
        Ok(())
    }

    #[test]
    fn stored_version_is_plain_text_readable_by_other_tools() -> Result<()> {
        let store = SqliteStore::open(Path::new(":memory:"))?;
        store.init()?;
        write_current(&store.conn, VersionId::At(Version(20_240_101_120_000)))?;

        let raw = store.conn.query_row(
            "SELECT version_num FROM engine_version WHERE id = 1",
            [],
            |row| row.get::<_, String>(0),
        )?;
        assert_eq!(raw, "20240101120000");
        Ok(())
    }

    #[test]
    fn read_only_open_of_a_missing_file_reads_base_without_creating_it() -> Result<()> {
        let path = unique_db_path("migration-engine-store-missing");
        let store = SqliteStore::open_read_only(&path)?;

        assert_eq!(store.read_current()?, VersionId::Base);
        assert!(store.applied_migrations()?.is_empty());
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn read_only_open_sees_committed_state_and_refuses_writes() -> Result<()> {
        let path = unique_db_path("migration-engine-store-read-only");
        {
            let writer = SqliteStore::open(&path)?;
            writer.init()?;
            write_current(&writer.conn, VersionId::At(Version(3)))?;
        }

        let reader = SqliteStore::open_read_only(&path)?;
        assert_eq!(reader.read_current()?, VersionId::At(Version(3)));
        assert!(write_current(&reader.conn, VersionId::Base).is_err());
        assert_eq!(reader.read_current()?, VersionId::At(Version(3)));

        drop(reader);
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(path.with_extension("sqlite3-wal"));
        let _ = fs::remove_file(path.with_extension("sqlite3-shm"));
        Ok(())
    }

    #[test]
    fn current_version_is_read_fresh_across_connections() -> Result<()> {
        let path = unique_db_path("migration-engine-store-fresh");
        let first = SqliteStore::open(&path)?;
        let second = SqliteStore::open(&path)?;
        first.init()?;

        assert_eq!(second.read_current()?, VersionId::Base);
        write_current(&first.conn, VersionId::At(Version(4)))?;
        assert_eq!(second.read_current()?, VersionId::At(Version(4)));

        drop(first);
        drop(second);
        let _ = fs::remove_file(&path);
        let _ = fs::remove_file(path.with_extension("sqlite3-wal"));
        let _ = fs::remove_file(path.with_extension("sqlite3-shm"));
        Ok(())
    }
}
