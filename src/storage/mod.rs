//! SQLite storage layer -- schema, pooling, advisory leases.

pub mod events;
pub mod schema;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

/// Connection pool type shared by all components.
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Canonical timestamp encoding for every TEXT column: fixed-width RFC 3339
/// with microseconds and a `Z` suffix, so lexicographic order is time order.
pub fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Advisory lease -- keeps a second detector from running against this store.
// ---------------------------------------------------------------------------

pub const DETECTOR_LEASE: &str = "detector";

/// Try to take the named lease. Succeeds when the row is absent, expired, or
/// already held by `holder`. Returns false when another live holder owns it.
pub fn acquire_lease(conn: &Connection, name: &str, holder: &str, ttl_seconds: i64) -> Result<bool> {
    let now = Utc::now();
    let expires = encode_ts(now + chrono::Duration::seconds(ttl_seconds));

    let current: Option<(String, String)> = conn
        .query_row(
            "SELECT holder, expires_at FROM leases WHERE name = ?1",
            params![name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match current {
        Some((owner, _)) if owner == holder => {
            conn.execute(
                "UPDATE leases SET expires_at = ?1 WHERE name = ?2",
                params![expires, name],
            )?;
            Ok(true)
        }
        Some((_, expires_at)) if expires_at >= encode_ts(now) => Ok(false),
        Some(_) => {
            conn.execute(
                "UPDATE leases SET holder = ?1, expires_at = ?2 WHERE name = ?3",
                params![holder, expires, name],
            )?;
            Ok(true)
        }
        None => {
            conn.execute(
                "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)",
                params![name, holder, expires],
            )?;
            Ok(true)
        }
    }
}

pub fn release_lease(conn: &Connection, name: &str, holder: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM leases WHERE name = ?1 AND holder = ?2",
        params![name, holder],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        schema::migrate(&conn).unwrap();
        conn
    }

    #[test]
    fn test_ts_roundtrip_preserves_order() {
        let a = Utc::now();
        let b = a + chrono::Duration::milliseconds(1);
        assert!(encode_ts(a) < encode_ts(b));
        let back = decode_ts(&encode_ts(a)).unwrap();
        // Encoding truncates to microseconds.
        assert!((a - back).num_microseconds().unwrap().abs() < 2);
    }

    #[test]
    fn test_lease_exclusivity() {
        let conn = test_conn();
        assert!(acquire_lease(&conn, DETECTOR_LEASE, "node-a", 60).unwrap());
        assert!(!acquire_lease(&conn, DETECTOR_LEASE, "node-b", 60).unwrap());
        // Renewal by the holder succeeds.
        assert!(acquire_lease(&conn, DETECTOR_LEASE, "node-a", 60).unwrap());
        release_lease(&conn, DETECTOR_LEASE, "node-a").unwrap();
        assert!(acquire_lease(&conn, DETECTOR_LEASE, "node-b", 60).unwrap());
    }

    #[test]
    fn test_expired_lease_is_stealable() {
        let conn = test_conn();
        assert!(acquire_lease(&conn, DETECTOR_LEASE, "node-a", -10).unwrap());
        assert!(acquire_lease(&conn, DETECTOR_LEASE, "node-b", 60).unwrap());
    }
}
