//! Event Log queries.
//!
//! The append path is the ingest hot path; everything else is the detector's
//! granular analysis over the typed columns (the raw payload stays opaque).

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::encode_ts;
use crate::ingest::event::{EventStatus, StoredEvent};
use crate::metrics::Dimension;

/// Append one validated event. The primary key rejects duplicate event ids.
pub fn append(conn: &Connection, event: &StoredEvent) -> Result<()> {
    conn.execute(
        "INSERT INTO events_log (
            event_id, received_at, merchant_id, provider_id, country, status,
            sub_status, amount_usd, issuer_name, card_brand, bin,
            response_code, merchant_advice_code, latency_ms, raw_payload
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            event.event_id,
            encode_ts(event.received_at),
            event.merchant_id,
            event.provider_id,
            event.country,
            event.status.as_str(),
            event.sub_status,
            event.amount_usd,
            event.issuer_name,
            event.card_brand,
            event.bin,
            event.response_code,
            event.merchant_advice_code,
            event.latency_ms,
            event.raw_payload,
        ],
    )?;
    Ok(())
}

/// Fetch the verbatim raw payload for an event id.
pub fn raw_payload(conn: &Connection, event_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT raw_payload FROM events_log WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn push_dimension(sql: &mut String, binds: &mut Vec<String>, dim: &Dimension) {
    let mut slot = |column: &str, value: &Option<String>| {
        if let Some(v) = value {
            sql.push_str(&format!(" AND {column} = ?"));
            binds.push(v.clone());
        }
    };
    slot("merchant_id", &dim.merchant);
    slot("country", &dim.country);
    slot("provider_id", &dim.provider);
    slot("issuer_name", &dim.issuer);
}

fn push_status_in(sql: &mut String, binds: &mut Vec<String>, statuses: &[EventStatus]) {
    let marks = vec!["?"; statuses.len()].join(", ");
    sql.push_str(&format!(" AND status IN ({marks})"));
    binds.extend(statuses.iter().map(|s| s.as_str().to_string()));
}

/// Sum of `amount_usd` for the given statuses within a dimension since `since`.
pub fn adverse_revenue(
    conn: &Connection,
    dim: &Dimension,
    adverse: &[EventStatus],
    since: DateTime<Utc>,
) -> Result<f64> {
    let mut sql =
        String::from("SELECT COALESCE(SUM(amount_usd), 0) FROM events_log WHERE received_at >= ?");
    let mut binds = vec![encode_ts(since)];
    push_dimension(&mut sql, &mut binds, dim);
    push_status_in(&mut sql, &mut binds, adverse);

    Ok(conn.query_row(&sql, params_from_iter(binds.iter()), |row| row.get(0))?)
}

/// Per-issuer impact within a dimension, largest first.
#[derive(Debug, Clone)]
pub struct IssuerImpact {
    pub issuer_name: String,
    pub count: u64,
    pub revenue_usd: f64,
    pub sub_statuses: Vec<String>,
}

pub fn issuer_breakdown(
    conn: &Connection,
    dim: &Dimension,
    adverse: &[EventStatus],
    since: DateTime<Utc>,
) -> Result<Vec<IssuerImpact>> {
    let mut sql = String::from(
        "SELECT issuer_name, COUNT(*), COALESCE(SUM(amount_usd), 0),
                GROUP_CONCAT(DISTINCT sub_status)
         FROM events_log
         WHERE received_at >= ? AND issuer_name IS NOT NULL",
    );
    let mut binds = vec![encode_ts(since)];
    push_dimension(&mut sql, &mut binds, dim);
    push_status_in(&mut sql, &mut binds, adverse);
    // An issuer needs a handful of hits before it is worth naming.
    sql.push_str(" GROUP BY issuer_name HAVING COUNT(*) >= 3 ORDER BY COUNT(*) DESC LIMIT 5");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds.iter()), |row| {
        let concat: Option<String> = row.get(3)?;
        Ok(IssuerImpact {
            issuer_name: row.get(0)?,
            count: row.get::<_, i64>(1)? as u64,
            revenue_usd: row.get(2)?,
            sub_statuses: concat
                .map(|s| s.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
        })
    })?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

/// True when more than half of the adverse events in the window carry the
/// given merchant advice code.
pub fn advice_code_majority(
    conn: &Connection,
    dim: &Dimension,
    adverse: &[EventStatus],
    since: DateTime<Utc>,
    advice_code: &str,
) -> Result<bool> {
    let mut sql = String::from(
        "SELECT COALESCE(SUM(CASE WHEN merchant_advice_code = ? THEN 1 ELSE 0 END), 0), COUNT(*)
         FROM events_log WHERE received_at >= ?",
    );
    let mut binds = vec![advice_code.to_string(), encode_ts(since)];
    push_dimension(&mut sql, &mut binds, dim);
    push_status_in(&mut sql, &mut binds, adverse);

    let (matching, total): (i64, i64) =
        conn.query_row(&sql, params_from_iter(binds.iter()), |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
    Ok(total > 0 && matching * 2 > total)
}

/// Statuses of the most recent events in a dimension, newest first.
pub fn recent_statuses(
    conn: &Connection,
    dim: &Dimension,
    since: DateTime<Utc>,
    limit: usize,
) -> Result<Vec<EventStatus>> {
    let mut sql = String::from("SELECT status FROM events_log WHERE received_at >= ?");
    let mut binds = vec![encode_ts(since)];
    push_dimension(&mut sql, &mut binds, dim);
    sql.push_str(&format!(" ORDER BY received_at DESC LIMIT {limit}"));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(binds.iter()), |row| {
        row.get::<_, String>(0)
    })?;

    let mut out = Vec::new();
    for r in rows {
        if let Some(status) = EventStatus::parse(&r?) {
            out.push(status);
        }
    }
    Ok(out)
}
