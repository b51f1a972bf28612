//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        -- Append-only event log. Typed columns carry the fields the core
        -- reads; raw_payload preserves the inbound JSON byte-for-byte for
        -- ad-hoc granular queries.
        CREATE TABLE IF NOT EXISTS events_log (
            event_id TEXT PRIMARY KEY,
            received_at TEXT NOT NULL,
            merchant_id TEXT NOT NULL,
            provider_id TEXT NOT NULL,
            country TEXT NOT NULL,
            status TEXT NOT NULL,
            sub_status TEXT,
            amount_usd REAL NOT NULL,
            issuer_name TEXT,
            card_brand TEXT,
            bin TEXT,
            response_code TEXT,
            merchant_advice_code TEXT,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            raw_payload TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alert_rules (
            rule_id TEXT PRIMARY KEY,
            merchant_id TEXT,
            filter_country TEXT,
            filter_provider TEXT,
            filter_issuer TEXT,
            metric_type TEXT NOT NULL,
            operator TEXT NOT NULL,
            threshold REAL NOT NULL,
            min_transactions INTEGER NOT NULL DEFAULT 30,
            start_hour INTEGER,
            end_hour INTEGER,
            severity TEXT NOT NULL DEFAULT 'WARNING',
            min_consecutive_errors INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS incidents (
            incident_id TEXT PRIMARY KEY,
            rule_id TEXT NOT NULL,
            dimension_key TEXT NOT NULL,
            state TEXT NOT NULL,
            severity TEXT NOT NULL,
            opened_at TEXT NOT NULL,
            last_evaluated_at TEXT NOT NULL,
            closed_at TEXT,
            observed_value REAL NOT NULL,
            affected_transactions INTEGER NOT NULL DEFAULT 0,
            revenue_at_risk_usd REAL NOT NULL DEFAULT 0,
            response_code_breakdown TEXT NOT NULL DEFAULT '{}',
            root_cause TEXT NOT NULL DEFAULT '{}',
            llm_explanation TEXT,
            suggested_action TEXT NOT NULL DEFAULT '{}',
            enrichment_status TEXT NOT NULL DEFAULT 'pending',
            confidence_score REAL NOT NULL DEFAULT 0.5,
            sla_breach_countdown_seconds INTEGER
        );

        CREATE TABLE IF NOT EXISTS merchant_baselines (
            merchant_id TEXT PRIMARY KEY,
            sla_minutes INTEGER NOT NULL DEFAULT 5,
            avg_approval_rate REAL
        );

        CREATE TABLE IF NOT EXISTS leases (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_received ON events_log(received_at);
        CREATE INDEX IF NOT EXISTS idx_events_dimension
            ON events_log(merchant_id, country, provider_id, status, received_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_opened ON incidents(opened_at);
        CREATE INDEX IF NOT EXISTS idx_incidents_state ON incidents(state);

        -- Deduplication invariant: one live incident per (rule, dimension).
        CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_live
            ON incidents(rule_id, dimension_key)
            WHERE state IN ('OPEN', 'ENRICHING', 'NOTIFIED');",
    )?;

    Ok(())
}
