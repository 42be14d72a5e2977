//! Accessors for the `metadata` key/value table

use crate::connection::Connection;
use crate::error::StoreResult;
use rusqlite::types::Value;
use rusqlite::ToSql;

/// Collation locale the database was built with
pub const KEY_LOCALE: &str = "locale";

/// Tokenizer version the full-text index was built with
pub const KEY_PARSER_VERSION: &str = "parser-version";

/// Tokenizer switches, as [`FtsFlags::bits`](crate::FtsFlags::bits)
pub const KEY_FTS_FLAGS: &str = "fts-flags";

/// Value stored under `key`, if any
pub fn get(conn: &mut Connection, key: &str) -> StoreResult<Option<Value>> {
    conn.query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
        row.get(0)
    })
}

/// Text value stored under `key`; non-text values read as absent
pub fn get_text(conn: &mut Connection, key: &str) -> StoreResult<Option<String>> {
    Ok(match get(conn, key)? {
        Some(Value::Text(text)) => Some(text),
        _ => None,
    })
}

/// Integer value stored under `key`; non-integer values read as absent
pub fn get_integer(conn: &mut Connection, key: &str) -> StoreResult<Option<i64>> {
    Ok(match get(conn, key)? {
        Some(Value::Integer(value)) => Some(value),
        _ => None,
    })
}

/// Insert or replace `key`
pub fn set<V: ToSql>(conn: &mut Connection, key: &str, value: V) -> StoreResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        rusqlite::params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionOptions, ConnectionRole};
    use tempfile::TempDir;

    #[test]
    fn test_set_replaces_value() {
        let dir = TempDir::new().unwrap();
        let mut conn = Connection::open(
            &dir.path().join("meta.db"),
            ConnectionRole::Write,
            &ConnectionOptions::default(),
        )
        .unwrap();
        crate::schema::initialize(&conn).unwrap();

        assert_eq!(get(&mut conn, KEY_LOCALE).unwrap(), None);

        set(&mut conn, KEY_LOCALE, "en_US.UTF-8").unwrap();
        set(&mut conn, KEY_LOCALE, "de_DE.UTF-8").unwrap();
        set(&mut conn, KEY_FTS_FLAGS, 5_i64).unwrap();

        assert_eq!(
            get_text(&mut conn, KEY_LOCALE).unwrap(),
            Some("de_DE.UTF-8".to_string())
        );
        assert_eq!(get_integer(&mut conn, KEY_FTS_FLAGS).unwrap(), Some(5));
        // Wrong type reads as absent
        assert_eq!(get_integer(&mut conn, KEY_LOCALE).unwrap(), None);
    }
}
