use axical_core::db::migrations::latest_version;
use axical_core::db::{open_db, open_db_in_memory, open_db_with, DbError, OpenOptions};
use rusqlite::Connection;
use std::time::Duration;

#[test]
fn open_db_in_memory_creates_item_table_and_index() {
    let conn = open_db_in_memory().unwrap();

    assert_eq!(schema_version(&conn), latest_version());
    assert_schema_object_exists(&conn, "table", "items");
    assert_schema_object_exists(&conn, "index", "idx_items_gsi1");
}

#[test]
fn reopening_file_database_keeps_schema_and_wal_mode() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("axical.db");

    let first = open_db(&path).unwrap();
    first
        .execute(
            "INSERT INTO items (pk, sk, gsi1pk, gsi1sk, attributes) VALUES ('P', 'S', NULL, NULL, '{}');",
            [],
        )
        .unwrap();
    drop(first);

    let options = OpenOptions {
        busy_timeout: Duration::from_millis(250),
    };
    let second = open_db_with(&path, options).unwrap();
    assert_eq!(schema_version(&second), latest_version());
    let rows: i64 = second
        .query_row("SELECT COUNT(*) FROM items;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 1);

    let mode: String = second
        .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode.to_ascii_lowercase(), "wal");
}

#[test]
fn opening_database_with_newer_schema_version_returns_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("future.db");

    let conn = Connection::open(&path).unwrap();
    conn.execute_batch("PRAGMA user_version = 999;").unwrap();
    drop(conn);

    match open_db(&path).unwrap_err() {
        DbError::UnsupportedSchemaVersion {
            db_version,
            latest_supported,
        } => {
            assert_eq!(db_version, 999);
            assert_eq!(latest_supported, latest_version());
        }
        other => panic!("unexpected error: {other}"),
    }
}

fn schema_version(conn: &Connection) -> u32 {
    conn.query_row("PRAGMA user_version;", [], |row| row.get(0))
        .unwrap()
}

fn assert_schema_object_exists(conn: &Connection, kind: &str, name: &str) {
    let exists: i64 = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = ?1 AND name = ?2);",
            [kind, name],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(exists, 1, "{kind} {name} does not exist");
}
