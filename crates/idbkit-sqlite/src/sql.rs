//! Ordered reads and writes against store and index tables
//!
//! Encoded keys compare bytewise, which is how SQLite orders BLOBs, so range
//! scans map directly onto `WHERE key > ? ORDER BY key LIMIT 1`.

use idbkit_core::backend::{Position, ScanDirection};
use idbkit_core::{EncodedKey, KeyRangeSpec};
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use crate::error::Result;

/// WHERE clause under construction with its positional parameters.
#[derive(Default)]
struct Filter {
    clauses: Vec<String>,
    params: Vec<Vec<u8>>,
}

impl Filter {
    fn push(&mut self, clause: impl Into<String>, params: &[&EncodedKey]) {
        self.clauses.push(clause.into());
        self.params
            .extend(params.iter().map(|key| key.as_bytes().to_vec()));
    }

    fn range(range: &KeyRangeSpec) -> Self {
        let mut filter = Self::default();
        if let Some(lower) = &range.lower {
            let op = if range.lower_open { ">" } else { ">=" };
            filter.push(format!("key {} ?", op), &[lower]);
        }
        if let Some(upper) = &range.upper {
            let op = if range.upper_open { "<" } else { "<=" };
            filter.push(format!("key {} ?", op), &[upper]);
        }
        filter
    }

    fn sql(&self) -> String {
        if self.clauses.is_empty() {
            "1".to_string()
        } else {
            self.clauses.join(" AND ")
        }
    }
}

/// Comparison operator selecting rows past a position.
fn past(direction: ScanDirection, inclusive: bool) -> &'static str {
    match (direction, inclusive) {
        (ScanDirection::Forward, false) => ">",
        (ScanDirection::Forward, true) => ">=",
        (ScanDirection::Reverse, false) => "<",
        (ScanDirection::Reverse, true) => "<=",
    }
}

fn order(direction: ScanDirection) -> &'static str {
    match direction {
        ScanDirection::Forward => "ASC",
        ScanDirection::Reverse => "DESC",
    }
}

pub fn record_get(conn: &Connection, table: &str, key: &EncodedKey) -> Result<Option<Vec<u8>>> {
    let value = conn
        .query_row(
            &format!("SELECT value FROM {} WHERE key = ?", table),
            [key.as_bytes()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

/// First committed record in `range`, past `after` (`(key, inclusive)`).
pub fn record_seek(
    conn: &Connection,
    table: &str,
    range: &KeyRangeSpec,
    direction: ScanDirection,
    after: Option<(&EncodedKey, bool)>,
) -> Result<Option<(EncodedKey, Vec<u8>)>> {
    let mut filter = Filter::range(range);
    if let Some((key, inclusive)) = after {
        filter.push(format!("key {} ?", past(direction, inclusive)), &[key]);
    }
    let sql = format!(
        "SELECT key, value FROM {} WHERE {} ORDER BY key {} LIMIT 1",
        table,
        filter.sql(),
        order(direction)
    );
    let row = conn
        .query_row(&sql, params_from_iter(filter.params.iter()), |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .optional()?;
    Ok(row.map(|(key, value)| (EncodedKey::from_bytes(key), value)))
}

/// First committed `(key, primary key)` entry in `range`.
///
/// Entry positions compare the pair, key-level positions only the key, so
/// a reverse key-level seek lands on the highest primary key of the next
/// lower index key.
pub fn index_seek(
    conn: &Connection,
    table: &str,
    range: &KeyRangeSpec,
    direction: ScanDirection,
    after: Option<&Position>,
) -> Result<Option<(EncodedKey, EncodedKey)>> {
    let mut filter = Filter::range(range);
    if let Some(position) = after {
        let op = past(direction, position.inclusive);
        match &position.primary {
            Some(primary) => filter.push(
                format!("(key, primary_key) {} (?, ?)", op),
                &[&position.key, primary],
            ),
            None => filter.push(format!("key {} ?", op), &[&position.key]),
        }
    }
    let order = order(direction);
    let sql = format!(
        "SELECT key, primary_key FROM {} WHERE {} ORDER BY key {order}, primary_key {order} LIMIT 1",
        table,
        filter.sql(),
    );
    let row = conn
        .query_row(&sql, params_from_iter(filter.params.iter()), |row| {
            Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Vec<u8>>(1)?))
        })
        .optional()?;
    Ok(row.map(|(key, primary)| (EncodedKey::from_bytes(key), EncodedKey::from_bytes(primary))))
}

/// Number of committed rows of a store or index table in `range`.
pub fn count(conn: &Connection, table: &str, range: &KeyRangeSpec) -> Result<u64> {
    let filter = Filter::range(range);
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", table, filter.sql());
    let total: i64 = conn.query_row(&sql, params_from_iter(filter.params.iter()), |row| {
        row.get(0)
    })?;
    Ok(total as u64)
}

/// Index keys of every committed entry pointing at `primary`.
pub fn index_keys_of(conn: &Connection, table: &str, primary: &EncodedKey) -> Result<Vec<EncodedKey>> {
    let mut stmt = conn.prepare(&format!("SELECT key FROM {} WHERE primary_key = ?", table))?;
    let keys = stmt
        .query_map([primary.as_bytes()], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(keys.into_iter().map(EncodedKey::from_bytes).collect())
}

pub fn record_put(conn: &Connection, table: &str, key: &EncodedKey, value: &[u8]) -> Result<()> {
    conn.execute(
        &format!("INSERT OR REPLACE INTO {} (key, value) VALUES (?, ?)", table),
        [key.as_bytes(), value],
    )?;
    Ok(())
}

pub fn record_delete(conn: &Connection, table: &str, key: &EncodedKey) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE key = ?", table),
        [key.as_bytes()],
    )?;
    Ok(())
}

pub fn index_insert(
    conn: &Connection,
    table: &str,
    key: &EncodedKey,
    primary: &EncodedKey,
) -> Result<()> {
    conn.execute(
        &format!("INSERT OR IGNORE INTO {} (key, primary_key) VALUES (?, ?)", table),
        [key.as_bytes(), primary.as_bytes()],
    )?;
    Ok(())
}

pub fn index_remove(
    conn: &Connection,
    table: &str,
    key: &EncodedKey,
    primary: &EncodedKey,
) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE key = ? AND primary_key = ?", table),
        [key.as_bytes(), primary.as_bytes()],
    )?;
    Ok(())
}

pub fn index_remove_primary(conn: &Connection, table: &str, primary: &EncodedKey) -> Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE primary_key = ?", table),
        [primary.as_bytes()],
    )?;
    Ok(())
}

/// Delete every row of a store or index table.
pub fn truncate(conn: &Connection, table: &str) -> Result<()> {
    conn.execute(&format!("DELETE FROM {}", table), [])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate;
    use crate::schema::{create_index_table, create_store_table};
    use idbkit_core::Key;
    use pretty_assertions::assert_eq;

    fn k(n: i32) -> EncodedKey {
        Key::from(n).encode()
    }

    const STORE: &str = "store_t";
    const INDEX: &str = "index_t";

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        create_store_table(&conn, STORE).unwrap();
        create_index_table(&conn, INDEX).unwrap();
        for n in [-2, 1, 3, 4] {
            record_put(&conn, STORE, &k(n), n.to_string().as_bytes()).unwrap();
        }
        for (key, primary) in [(1, 10), (1, 11), (2, 20), (3, 30), (3, 31)] {
            index_insert(&conn, INDEX, &k(key), &k(primary)).unwrap();
        }
        conn
    }

    fn at(key: i32, primary: Option<i32>, inclusive: bool) -> Position {
        Position {
            key: k(key),
            primary: primary.map(k),
            inclusive,
        }
    }

    #[test]
    fn test_record_seek_follows_key_order() {
        let conn = setup();
        let all = KeyRangeSpec::all();
        let first = record_seek(&conn, STORE, &all, ScanDirection::Forward, None).unwrap();
        assert_eq!(first.map(|(key, _)| key), Some(k(-2)));
        let last = record_seek(&conn, STORE, &all, ScanDirection::Reverse, None).unwrap();
        assert_eq!(last.map(|(key, _)| key), Some(k(4)));

        let next = record_seek(&conn, STORE, &all, ScanDirection::Forward, Some((&k(1), false))).unwrap();
        assert_eq!(next.map(|(_, value)| value), Some(b"3".to_vec()));

        let range = KeyRangeSpec {
            lower: Some(k(1)),
            upper: Some(k(3)),
            lower_open: true,
            upper_open: false,
        };
        let only = record_seek(&conn, STORE, &range, ScanDirection::Reverse, None).unwrap();
        assert_eq!(only.map(|(key, _)| key), Some(k(3)));
    }

    #[test]
    fn test_index_seek_entry_and_key_positions() {
        let conn = setup();
        let all = KeyRangeSpec::all();
        let seek = |direction, after: Option<Position>| {
            index_seek(&conn, INDEX, &all, direction, after.as_ref()).unwrap()
        };
        assert_eq!(seek(ScanDirection::Forward, None), Some((k(1), k(10))));
        assert_eq!(
            seek(ScanDirection::Forward, Some(at(1, Some(10), false))),
            Some((k(1), k(11)))
        );
        assert_eq!(
            seek(ScanDirection::Forward, Some(at(1, None, false))),
            Some((k(2), k(20)))
        );
        assert_eq!(
            seek(ScanDirection::Reverse, Some(at(2, None, false))),
            Some((k(1), k(11)))
        );
        assert_eq!(
            seek(ScanDirection::Forward, Some(at(3, Some(31), true))),
            Some((k(3), k(31)))
        );
        assert_eq!(seek(ScanDirection::Forward, Some(at(3, Some(32), true))), None);
    }

    #[test]
    fn test_count_respects_range_bounds() {
        let conn = setup();
        assert_eq!(count(&conn, STORE, &KeyRangeSpec::all()).unwrap(), 4);
        let range = KeyRangeSpec {
            lower: Some(k(1)),
            upper: Some(k(4)),
            lower_open: true,
            upper_open: false,
        };
        assert_eq!(count(&conn, STORE, &range).unwrap(), 2);
        assert_eq!(count(&conn, INDEX, &KeyRangeSpec::only(k(3))).unwrap(), 2);
        assert_eq!(count(&conn, INDEX, &KeyRangeSpec::only(k(5))).unwrap(), 0);
    }

    #[test]
    fn test_index_removal_by_primary() {
        let conn = setup();
        assert_eq!(index_keys_of(&conn, INDEX, &k(20)).unwrap(), vec![k(2)]);
        index_remove_primary(&conn, INDEX, &k(20)).unwrap();
        assert!(index_keys_of(&conn, INDEX, &k(20)).unwrap().is_empty());
        index_remove(&conn, INDEX, &k(1), &k(10)).unwrap();
        let first = index_seek(&conn, INDEX, &KeyRangeSpec::all(), ScanDirection::Forward, None).unwrap();
        assert_eq!(first, Some((k(1), k(11))));
    }
}
