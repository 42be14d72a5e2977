//! Base schema and version bookkeeping
//!
//! The store owns only two tables: the `metadata` key/value table and the
//! resource table that hands out graph ids. Everything else is created by
//! the data layer on top. The schema version lives in `PRAGMA user_version`.

use crate::connection::Connection;
use crate::error::{StoreError, StoreResult};
use rusqlite::OpenFlags;
use std::path::Path;
use tracing::{debug, info};

/// Schema version - increment when making schema changes
pub const SCHEMA_VERSION: i32 = 2;

/// Table every healthy database has; its absence means the file is unusable
pub const RESOURCE_TABLE: &str = "Resource";

/// Key/value table holding locale, parser version and tokenizer flags
pub const METADATA_TABLE: &str = "metadata";

/// Create the base tables on a freshly recreated database
pub fn initialize(conn: &Connection) -> StoreResult<()> {
    debug!(path = ?conn.path(), "Creating base schema");
    conn.execute_batch(BASE_SCHEMA).map_err(|e| {
        StoreError::Query(format!("Failed to create base schema: {}", e))
    })?;
    info!(path = ?conn.path(), "Base schema created");
    Ok(())
}

/// `PRAGMA user_version` of the connection's main database
pub fn read_version(conn: &Connection) -> StoreResult<i32> {
    Ok(conn
        .raw()
        .query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Record `version` as the schema version
pub fn write_version(conn: &Connection, version: i32) -> StoreResult<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
    debug!(version, "Schema version written");
    Ok(())
}

/// Read the schema version of the file at `path` without the full store setup.
///
/// Any failure (unreadable file, not a database) reads as version 0.
pub fn file_version(path: &Path, read_only: bool) -> i32 {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
    } | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let version = rusqlite::Connection::open_with_flags(path, flags).and_then(|conn| {
        conn.query_row("PRAGMA user_version", [], |row| row.get::<_, i32>(0))
    });
    match version {
        Ok(version) => version,
        Err(e) => {
            debug!(path = ?path, error = %e, "Could not read schema version");
            0
        }
    }
}

/// Whether the resource table can be queried
pub fn has_resource_table(conn: &Connection) -> StoreResult<()> {
    conn.raw()
        .prepare(&format!("SELECT 1 FROM {}", RESOURCE_TABLE))
        .map(drop)
        .map_err(|e| StoreError::Query(format!("Resource table unusable: {}", e)))
}

/// Id of the resource `uri`, allocating one if it has none yet
pub fn ensure_resource(conn: &mut Connection, uri: &str) -> StoreResult<i64> {
    conn.execute("INSERT OR IGNORE INTO Resource (Uri) VALUES (?1)", [uri])?;
    conn.query_row("SELECT ID FROM Resource WHERE Uri = ?1", [uri], |row| row.get(0))?
        .ok_or_else(|| StoreError::Query(format!("Resource {} vanished after insert", uri)))
}

const BASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT NOT NULL PRIMARY KEY,
    value
);

CREATE TABLE IF NOT EXISTS Resource (
    ID INTEGER NOT NULL PRIMARY KEY,
    Uri TEXT NOT NULL UNIQUE
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionOptions, ConnectionRole};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Connection {
        Connection::open(
            &dir.path().join("meta.db"),
            ConnectionRole::Write,
            &ConnectionOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_schema_applies_cleanly() {
        let dir = TempDir::new().unwrap();
        let conn = open(&dir);

        initialize(&conn).unwrap();
        has_resource_table(&conn).unwrap();
        assert_eq!(read_version(&conn).unwrap(), 0);
    }

    #[test]
    fn test_schema_idempotent() {
        let dir = TempDir::new().unwrap();
        let conn = open(&dir);

        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        has_resource_table(&conn).unwrap();
    }

    #[test]
    fn test_version_roundtrip_and_file_version() {
        let dir = TempDir::new().unwrap();
        let conn = open(&dir);
        initialize(&conn).unwrap();

        write_version(&conn, SCHEMA_VERSION).unwrap();
        assert_eq!(read_version(&conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(file_version(conn.path(), true), SCHEMA_VERSION);
    }

    #[test]
    fn test_unreadable_file_version_is_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.db");
        std::fs::write(&path, b"this is not a database, not even close, sorry").unwrap();

        assert_eq!(file_version(&path, true), 0);
        assert_eq!(file_version(&dir.path().join("missing.db"), false), 0);
    }

    #[test]
    fn test_missing_resource_table_detected() {
        let dir = TempDir::new().unwrap();
        let conn = open(&dir);
        assert!(has_resource_table(&conn).is_err());
    }

    #[test]
    fn test_ensure_resource_is_stable() {
        let dir = TempDir::new().unwrap();
        let mut conn = open(&dir);
        initialize(&conn).unwrap();

        let a = ensure_resource(&mut conn, "urn:graph:a").unwrap();
        let b = ensure_resource(&mut conn, "urn:graph:b").unwrap();
        assert_ne!(a, b);
        assert_eq!(ensure_resource(&mut conn, "urn:graph:a").unwrap(), a);
    }
}
