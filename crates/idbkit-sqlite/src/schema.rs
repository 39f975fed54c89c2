//! On-disk layout: file names, per-store tables and the metadata table
//!
//! Each object store is a `store_*` table and each index an `index_*` table.
//! Names are sanitized to `[A-Za-z0-9_]` and end in a hash of the original
//! name, so two distinct names never share a table. `__idbkit_meta` holds
//! the serialized schema under `schema` and one key generator per store
//! under `counter:<store id>`.

use idbkit_core::DatabaseMeta;
use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// File extension of database files in a backend directory.
pub const FILE_EXTENSION: &str = "sqlite3";

const SCHEMA_KEY: &str = "schema";

fn sanitize(name: &str) -> String {
    name.chars()
        .take(32)
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Hex prefix of the SHA-256 of `parts` joined by NUL.
fn hash(parts: &[&str]) -> String {
    let digest = Sha256::digest(parts.join("\0").as_bytes());
    digest[..8].iter().map(|b| format!("{:02x}", b)).collect()
}

/// File name for a logical database.
pub fn file_name(database: &str) -> String {
    format!("{}-{}.{}", sanitize(database), hash(&[database]), FILE_EXTENSION)
}

/// Table holding the records of `store`. Safe to splice into SQL unquoted.
pub fn store_table(store: &str) -> String {
    format!("store_{}_{}", sanitize(store), hash(&[store]))
}

/// Table holding the entries of `index` on `store`.
pub fn index_table(store: &str, index: &str) -> String {
    format!(
        "index_{}_{}_{}",
        sanitize(store),
        sanitize(index),
        hash(&[store, index])
    )
}

pub fn create_store_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE {table} (
            key BLOB PRIMARY KEY,
            value BLOB NOT NULL
        ) WITHOUT ROWID;"
    ))?;
    Ok(())
}

/// Index rows are ordered by `(key, primary_key)`; the secondary index
/// serves removal by primary key.
pub fn create_index_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE {table} (
            key BLOB NOT NULL,
            primary_key BLOB NOT NULL,
            PRIMARY KEY (key, primary_key)
        ) WITHOUT ROWID;
        CREATE INDEX {table}_by_primary ON {table} (primary_key);"
    ))?;
    Ok(())
}

pub fn rename_store_table(conn: &Connection, from: &str, to: &str) -> Result<()> {
    conn.execute_batch(&format!("ALTER TABLE {from} RENAME TO {to};"))?;
    Ok(())
}

/// Rename an index table along with its secondary index, whose name would
/// otherwise block a later table reusing the old name.
pub fn rename_index_table(conn: &Connection, from: &str, to: &str) -> Result<()> {
    conn.execute_batch(&format!(
        "ALTER TABLE {from} RENAME TO {to};
        DROP INDEX IF EXISTS {from}_by_primary;
        CREATE INDEX {to}_by_primary ON {to} (primary_key);"
    ))?;
    Ok(())
}

pub fn drop_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", table))?;
    Ok(())
}

/// Committed schema, or a fresh version 0 schema for a new file.
pub fn load_meta(conn: &Connection, database: &str) -> Result<DatabaseMeta> {
    let json: Option<String> = conn
        .query_row(
            "SELECT value FROM __idbkit_meta WHERE key = ?",
            [SCHEMA_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match json {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(DatabaseMeta::new(database)),
    }
}

pub fn save_meta(conn: &Connection, meta: &DatabaseMeta) -> Result<()> {
    let json = serde_json::to_string(meta)?;
    conn.execute(
        "INSERT OR REPLACE INTO __idbkit_meta (key, value) VALUES (?, ?)",
        [SCHEMA_KEY, json.as_str()],
    )?;
    Ok(())
}

fn counter_key(store: u64) -> String {
    format!("counter:{}", store)
}

/// Next generated key of a store (1 when never used).
pub fn load_counter(conn: &Connection, store: u64) -> Result<u64> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM __idbkit_meta WHERE key = ?",
            [counter_key(store)],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(1))
}

pub fn save_counter(conn: &Connection, store: u64, next: u64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO __idbkit_meta (key, value) VALUES (?, ?)",
        [counter_key(store), next.to_string()],
    )?;
    Ok(())
}

pub fn delete_counter(conn: &Connection, store: u64) -> Result<()> {
    conn.execute(
        "DELETE FROM __idbkit_meta WHERE key = ?",
        [counter_key(store)],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate;
    use pretty_assertions::assert_eq;

    fn is_identifier(name: &str) -> bool {
        name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    }

    #[test]
    fn test_file_names_are_safe_and_distinct() {
        let a = file_name("shop");
        let b = file_name("shop/../etc");
        assert!(a.starts_with("shop-"));
        assert!(a.ends_with(".sqlite3"));
        assert!(!b.contains('/'));
        assert_ne!(file_name("a b"), file_name("a_b"));
    }

    #[test]
    fn test_table_names_never_collide_after_sanitizing() {
        let spaced = store_table("my store");
        let underscored = store_table("my_store");
        assert!(is_identifier(&spaced));
        assert!(spaced.starts_with("store_my_store_"));
        assert_ne!(spaced, underscored);

        // The store name is part of the index hash.
        assert_ne!(index_table("a", "b_c"), index_table("a_b", "c"));
        assert!(is_identifier(&index_table("Kunden", "nach Namen")));
    }

    #[test]
    fn test_renamed_index_table_frees_its_old_name() {
        let conn = Connection::open_in_memory().unwrap();
        let old = index_table("people", "byName");
        let new = index_table("people", "byFullName");
        create_index_table(&conn, &old).unwrap();
        rename_index_table(&conn, &old, &new).unwrap();
        create_index_table(&conn, &old).unwrap();
        drop_table(&conn, &new).unwrap();
        drop_table(&conn, &old).unwrap();
    }

    #[test]
    fn test_meta_roundtrip() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(load_meta(&conn, "db").unwrap(), DatabaseMeta::new("db"));

        let mut meta = DatabaseMeta::new("db");
        meta.version = 4;
        save_meta(&conn, &meta).unwrap();
        assert_eq!(load_meta(&conn, "db").unwrap(), meta);
    }

    #[test]
    fn test_counters_default_to_one() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        assert_eq!(load_counter(&conn, 3).unwrap(), 1);
        save_counter(&conn, 3, 17).unwrap();
        assert_eq!(load_counter(&conn, 3).unwrap(), 17);
        delete_counter(&conn, 3).unwrap();
        assert_eq!(load_counter(&conn, 3).unwrap(), 1);
    }
}
