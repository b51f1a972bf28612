//! Incident lifecycle over the durable store.
//!
//! The detector is the only writer of state transitions; the enricher's
//! completion path is a guarded compare-and-set on ENRICHING so it can never
//! clobber a recovery that happened mid-flight.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{EnrichmentStatus, IncidentRecord, IncidentState, RootCause, Severity, SuggestedAction};
use crate::storage::{decode_ts, encode_ts, Pool};

/// Everything the detector knows when it opens an incident.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub rule_id: Uuid,
    pub dimension_key: String,
    pub severity: Severity,
    pub observed_value: f64,
    pub affected_transactions: u64,
    pub revenue_at_risk_usd: f64,
    pub response_code_breakdown: serde_json::Value,
    pub root_cause: RootCause,
    pub suggested_action: SuggestedAction,
    pub confidence_score: f64,
    pub sla_breach_countdown_seconds: Option<i64>,
}

#[derive(Clone)]
pub struct IncidentManager {
    pool: Pool,
}

impl IncidentManager {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// The live (OPEN/ENRICHING/NOTIFIED) incident for a key, if any.
    pub fn live_incident(
        &self,
        rule_id: Uuid,
        dimension_key: &str,
    ) -> Result<Option<(Uuid, IncidentState)>> {
        let conn = self.pool.get()?;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT incident_id, state FROM incidents
                 WHERE rule_id = ?1 AND dimension_key = ?2
                   AND state IN ('OPEN', 'ENRICHING', 'NOTIFIED')",
                params![rule_id.to_string(), dimension_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.and_then(|(id, state)| {
            Some((Uuid::parse_str(&id).ok()?, IncidentState::parse(&state)?))
        }))
    }

    /// True when an incident for this key closed within the cooldown window.
    pub fn closed_within(
        &self,
        rule_id: Uuid,
        dimension_key: &str,
        cooldown_seconds: i64,
    ) -> Result<bool> {
        let cutoff = encode_ts(Utc::now() - Duration::seconds(cooldown_seconds));
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM incidents
             WHERE rule_id = ?1 AND dimension_key = ?2
               AND state = 'RECOVERED' AND closed_at >= ?3",
            params![rule_id.to_string(), dimension_key, cutoff],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Insert a fresh OPEN incident. The partial unique index enforces the
    /// one-live-incident invariant; a constraint hit surfaces as an error.
    pub fn open(&self, new: &NewIncident) -> Result<Uuid> {
        let incident_id = Uuid::new_v4();
        let now = encode_ts(Utc::now());
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO incidents (
                incident_id, rule_id, dimension_key, state, severity,
                opened_at, last_evaluated_at, observed_value,
                affected_transactions, revenue_at_risk_usd,
                response_code_breakdown, root_cause, suggested_action,
                enrichment_status, confidence_score, sla_breach_countdown_seconds
             ) VALUES (?1, ?2, ?3, 'OPEN', ?4, ?5, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'pending', ?12, ?13)",
            params![
                incident_id.to_string(),
                new.rule_id.to_string(),
                new.dimension_key,
                new.severity.as_str(),
                now,
                new.observed_value,
                new.affected_transactions as i64,
                new.revenue_at_risk_usd,
                new.response_code_breakdown.to_string(),
                serde_json::to_string(&new.root_cause)?,
                serde_json::to_string(&new.suggested_action)?,
                new.confidence_score,
                new.sla_breach_countdown_seconds,
            ],
        )?;
        Ok(incident_id)
    }

    /// OPEN -> ENRICHING, handing the incident to the enrichment queue.
    pub fn mark_enriching(&self, incident_id: Uuid) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE incidents SET state = 'ENRICHING' WHERE incident_id = ?1 AND state = 'OPEN'",
            params![incident_id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// In-place refresh of a live incident on a re-firing tick.
    pub fn refresh(
        &self,
        incident_id: Uuid,
        observed_value: f64,
        affected_transactions: u64,
        revenue_at_risk_usd: f64,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE incidents SET
                observed_value = ?2,
                affected_transactions = ?3,
                revenue_at_risk_usd = ?4,
                last_evaluated_at = ?5
             WHERE incident_id = ?1",
            params![
                incident_id.to_string(),
                observed_value,
                affected_transactions as i64,
                revenue_at_risk_usd,
                encode_ts(Utc::now()),
            ],
        )?;
        Ok(())
    }

    /// Record a cooldown suppression. Reuses the latest SUPPRESSED marker for
    /// the key when one exists inside the cooldown window, otherwise inserts
    /// a fresh terminal marker.
    pub fn suppress(
        &self,
        rule_id: Uuid,
        dimension_key: &str,
        severity: Severity,
        observed_value: f64,
        cooldown_seconds: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let cutoff = encode_ts(now - Duration::seconds(cooldown_seconds));
        let conn = self.pool.get()?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT incident_id FROM incidents
                 WHERE rule_id = ?1 AND dimension_key = ?2
                   AND state = 'SUPPRESSED' AND opened_at >= ?3
                 ORDER BY opened_at DESC LIMIT 1",
                params![rule_id.to_string(), dimension_key, cutoff],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE incidents SET last_evaluated_at = ?2, observed_value = ?3
                     WHERE incident_id = ?1",
                    params![id, encode_ts(now), observed_value],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO incidents (
                        incident_id, rule_id, dimension_key, state, severity,
                        opened_at, last_evaluated_at, observed_value
                     ) VALUES (?1, ?2, ?3, 'SUPPRESSED', ?4, ?5, ?5, ?6)",
                    params![
                        Uuid::new_v4().to_string(),
                        rule_id.to_string(),
                        dimension_key,
                        severity.as_str(),
                        encode_ts(now),
                        observed_value,
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// Close a live incident on recovery.
    pub fn recover(&self, incident_id: Uuid) -> Result<bool> {
        let now = encode_ts(Utc::now());
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE incidents SET state = 'RECOVERED', closed_at = ?2, last_evaluated_at = ?2
             WHERE incident_id = ?1 AND state IN ('OPEN', 'ENRICHING', 'NOTIFIED')",
            params![incident_id.to_string(), now],
        )?;
        Ok(changed > 0)
    }

    /// Enricher completion. Returns true when the ENRICHING -> NOTIFIED
    /// transition applied; when the incident left ENRICHING in the meantime
    /// the explanation fields are still recorded.
    pub fn complete_enrichment(
        &self,
        incident_id: Uuid,
        explanation: Option<&str>,
        suggested_action: Option<&SuggestedAction>,
        status: EnrichmentStatus,
    ) -> Result<bool> {
        let conn = self.pool.get()?;
        let action_json = match suggested_action {
            Some(a) => Some(serde_json::to_string(a)?),
            None => None,
        };

        let advanced = conn.execute(
            "UPDATE incidents SET
                state = 'NOTIFIED',
                llm_explanation = ?2,
                suggested_action = COALESCE(?3, suggested_action),
                enrichment_status = ?4
             WHERE incident_id = ?1 AND state = 'ENRICHING'",
            params![
                incident_id.to_string(),
                explanation,
                action_json,
                status.as_str(),
            ],
        )?;

        if advanced == 0 {
            conn.execute(
                "UPDATE incidents SET llm_explanation = ?2, enrichment_status = ?3
                 WHERE incident_id = ?1",
                params![incident_id.to_string(), explanation, status.as_str()],
            )?;
        }
        Ok(advanced > 0)
    }

    /// Live incidents of one rule (for the recovery pass).
    pub fn live_for_rule(&self, rule_id: Uuid) -> Result<Vec<(Uuid, String, IncidentState)>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT incident_id, dimension_key, state FROM incidents
             WHERE rule_id = ?1 AND state IN ('OPEN', 'ENRICHING', 'NOTIFIED')",
        )?;
        let rows = stmt.query_map(params![rule_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for r in rows {
            let (id, dim, state) = r?;
            if let (Ok(id), Some(state)) = (Uuid::parse_str(&id), IncidentState::parse(&state)) {
                out.push((id, dim, state));
            }
        }
        Ok(out)
    }

    /// Incident ids sitting in ENRICHING, oldest first. Used to (re)fill the
    /// enrichment queue on startup and to rescue stalled entries.
    pub fn enriching_ids(&self) -> Result<Vec<Uuid>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT incident_id FROM incidents WHERE state = 'ENRICHING' ORDER BY opened_at ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for r in rows {
            if let Ok(id) = Uuid::parse_str(&r?) {
                out.push(id);
            }
        }
        Ok(out)
    }

    pub fn get(&self, incident_id: Uuid) -> Result<Option<IncidentRecord>> {
        let conn = self.pool.get()?;
        Ok(conn
            .query_row(
                &format!("{SELECT_INCIDENT} WHERE incident_id = ?1"),
                params![incident_id.to_string()],
                row_to_incident,
            )
            .optional()?)
    }

    /// Incidents for the alerts endpoint: newest first, optional lower bound
    /// on `opened_at` and state filter.
    pub fn query(
        &self,
        since: Option<DateTime<Utc>>,
        states: Option<&[IncidentState]>,
        limit: usize,
    ) -> Result<Vec<IncidentRecord>> {
        let mut sql = format!("{SELECT_INCIDENT} WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();
        if let Some(since) = since {
            sql.push_str(" AND opened_at >= ?");
            binds.push(encode_ts(since));
        }
        if let Some(states) = states {
            let marks = vec!["?"; states.len()].join(", ");
            sql.push_str(&format!(" AND state IN ({marks})"));
            binds.extend(states.iter().map(|s| s.as_str().to_string()));
        }
        sql.push_str(&format!(" ORDER BY opened_at DESC LIMIT {limit}"));

        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), row_to_incident)?;

        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

const SELECT_INCIDENT: &str = "SELECT
    incident_id, rule_id, dimension_key, state, severity,
    opened_at, last_evaluated_at, closed_at, observed_value,
    affected_transactions, revenue_at_risk_usd, response_code_breakdown,
    root_cause, llm_explanation, suggested_action, enrichment_status,
    confidence_score, sla_breach_countdown_seconds
 FROM incidents";

fn row_to_incident(row: &Row<'_>) -> rusqlite::Result<IncidentRecord> {
    let id: String = row.get(0)?;
    let rule_id: String = row.get(1)?;
    let state: String = row.get(3)?;
    let severity: String = row.get(4)?;
    let opened: String = row.get(5)?;
    let evaluated: String = row.get(6)?;
    let closed: Option<String> = row.get(7)?;
    let breakdown: String = row.get(11)?;
    let root_cause: String = row.get(12)?;
    let action: String = row.get(14)?;
    let enrichment: String = row.get(15)?;

    Ok(IncidentRecord {
        incident_id: Uuid::parse_str(&id).unwrap_or_default(),
        rule_id: Uuid::parse_str(&rule_id).unwrap_or_default(),
        dimension_key: row.get(2)?,
        state: IncidentState::parse(&state).unwrap_or(IncidentState::Open),
        severity: Severity::parse(&severity).unwrap_or(Severity::Warning),
        opened_at: decode_ts(&opened).unwrap_or_else(Utc::now),
        last_evaluated_at: decode_ts(&evaluated).unwrap_or_else(Utc::now),
        closed_at: closed.as_deref().and_then(decode_ts),
        observed_value: row.get(8)?,
        affected_transactions: row.get::<_, i64>(9)? as u64,
        revenue_at_risk_usd: row.get(10)?,
        response_code_breakdown: serde_json::from_str(&breakdown).unwrap_or_default(),
        root_cause: serde_json::from_str(&root_cause).unwrap_or_default(),
        llm_explanation: row.get(13)?,
        suggested_action: serde_json::from_str(&action).unwrap_or_default(),
        enrichment_status: EnrichmentStatus::parse(&enrichment).unwrap_or(EnrichmentStatus::Pending),
        confidence_score: row.get(16)?,
        sla_breach_countdown_seconds: row.get(17)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use r2d2_sqlite::SqliteConnectionManager;

    fn test_manager() -> IncidentManager {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager).unwrap();
        crate::storage::schema::migrate(&pool.get().unwrap()).unwrap();
        IncidentManager::new(pool)
    }

    fn sample(rule_id: Uuid) -> NewIncident {
        NewIncident {
            rule_id,
            dimension_key: "shopito/MX/STRIPE/_".to_string(),
            severity: Severity::Warning,
            observed_value: 0.30,
            affected_transactions: 30,
            revenue_at_risk_usd: 1234.5,
            response_code_breakdown: serde_json::json!({"504": 20, "500": 10}),
            root_cause: RootCause {
                merchant: Some("shopito".to_string()),
                country: Some("MX".to_string()),
                provider: Some("STRIPE".to_string()),
                issue: "ERROR_RATE above threshold".to_string(),
                scope: "All transactions".to_string(),
                response_code: Some("504".to_string()),
            },
            suggested_action: SuggestedAction {
                label: "Increase timeout or failover STRIPE".to_string(),
                action_type: "INCREASE_TIMEOUT".to_string(),
            },
            confidence_score: 0.85,
            sla_breach_countdown_seconds: None,
        }
    }

    #[test]
    fn test_open_then_live_lookup() {
        let mgr = test_manager();
        let rule_id = Uuid::new_v4();
        let id = mgr.open(&sample(rule_id)).unwrap();

        let (live_id, state) = mgr
            .live_incident(rule_id, "shopito/MX/STRIPE/_")
            .unwrap()
            .unwrap();
        assert_eq!(live_id, id);
        assert_eq!(state, IncidentState::Open);

        let record = mgr.get(id).unwrap().unwrap();
        assert_eq!(record.enrichment_status, EnrichmentStatus::Pending);
        assert_eq!(record.affected_transactions, 30);
        assert!(record.opened_at <= record.last_evaluated_at);
    }

    #[test]
    fn test_duplicate_live_incident_rejected() {
        let mgr = test_manager();
        let rule_id = Uuid::new_v4();
        mgr.open(&sample(rule_id)).unwrap();
        assert!(mgr.open(&sample(rule_id)).is_err());
    }

    #[test]
    fn test_lifecycle_to_notified() {
        let mgr = test_manager();
        let rule_id = Uuid::new_v4();
        let id = mgr.open(&sample(rule_id)).unwrap();

        assert!(mgr.mark_enriching(id).unwrap());
        // Second CAS is a no-op.
        assert!(!mgr.mark_enriching(id).unwrap());
        assert_eq!(mgr.enriching_ids().unwrap(), vec![id]);

        assert!(mgr
            .complete_enrichment(id, Some("BBVA timeout spike"), None, EnrichmentStatus::Succeeded)
            .unwrap());
        let record = mgr.get(id).unwrap().unwrap();
        assert_eq!(record.state, IncidentState::Notified);
        assert_eq!(record.llm_explanation.as_deref(), Some("BBVA timeout spike"));
        assert_eq!(record.enrichment_status, EnrichmentStatus::Succeeded);
    }

    #[test]
    fn test_recovery_wins_over_late_enrichment() {
        let mgr = test_manager();
        let rule_id = Uuid::new_v4();
        let id = mgr.open(&sample(rule_id)).unwrap();
        mgr.mark_enriching(id).unwrap();

        assert!(mgr.recover(id).unwrap());
        // Late enrichment completion must not resurrect the incident.
        assert!(!mgr
            .complete_enrichment(id, Some("late"), None, EnrichmentStatus::Succeeded)
            .unwrap());

        let record = mgr.get(id).unwrap().unwrap();
        assert_eq!(record.state, IncidentState::Recovered);
        assert!(record.closed_at.is_some());
        assert!(record.last_evaluated_at <= record.closed_at.unwrap());
        // The explanation is still recorded on the closed row.
        assert_eq!(record.llm_explanation.as_deref(), Some("late"));
    }

    #[test]
    fn test_cooldown_visibility() {
        let mgr = test_manager();
        let rule_id = Uuid::new_v4();
        let id = mgr.open(&sample(rule_id)).unwrap();
        mgr.recover(id).unwrap();

        assert!(mgr.closed_within(rule_id, "shopito/MX/STRIPE/_", 600).unwrap());
        assert!(!mgr.closed_within(rule_id, "shopito/MX/STRIPE/_", 0).unwrap());
        assert!(!mgr.closed_within(Uuid::new_v4(), "shopito/MX/STRIPE/_", 600).unwrap());
    }

    #[test]
    fn test_suppress_reuses_marker() {
        let mgr = test_manager();
        let rule_id = Uuid::new_v4();
        mgr.suppress(rule_id, "shopito/MX/STRIPE/_", Severity::Warning, 0.2, 600)
            .unwrap();
        mgr.suppress(rule_id, "shopito/MX/STRIPE/_", Severity::Warning, 0.25, 600)
            .unwrap();

        let suppressed = mgr
            .query(None, Some(&[IncidentState::Suppressed]), 10)
            .unwrap();
        assert_eq!(suppressed.len(), 1);
        assert_eq!(suppressed[0].observed_value, 0.25);
    }

    #[test]
    fn test_query_filters_and_orders() {
        let mgr = test_manager();
        let rule_a = Uuid::new_v4();
        let rule_b = Uuid::new_v4();
        let first = mgr.open(&sample(rule_a)).unwrap();
        // Distinct opened_at so the ordering assertion below is stable.
        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut second_spec = sample(rule_b);
        second_spec.dimension_key = "techstore/BR/ADYEN/_".to_string();
        let second = mgr.open(&second_spec).unwrap();
        mgr.recover(first).unwrap();

        let all = mgr.query(None, None, 10).unwrap();
        assert_eq!(all.len(), 2);
        // Newest first.
        assert_eq!(all[0].incident_id, second);

        let open_only = mgr.query(None, Some(&[IncidentState::Open]), 10).unwrap();
        assert_eq!(open_only.len(), 1);
        assert_eq!(open_only[0].incident_id, second);

        let future = mgr
            .query(Some(Utc::now() + Duration::seconds(60)), None, 10)
            .unwrap();
        assert!(future.is_empty());
    }
}
