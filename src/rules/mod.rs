//! User-defined alert rules: model, registry CRUD, detector snapshot.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::detect::Severity;
use crate::ingest::event::EventStatus;
use crate::storage::{decode_ts, encode_ts, Pool};

/// What a rule measures over its evaluation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    ApprovalRate,
    ErrorRate,
    DeclineRate,
    TotalVolume,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalRate => "APPROVAL_RATE",
            Self::ErrorRate => "ERROR_RATE",
            Self::DeclineRate => "DECLINE_RATE",
            Self::TotalVolume => "TOTAL_VOLUME",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "APPROVAL_RATE" => Some(Self::ApprovalRate),
            "ERROR_RATE" => Some(Self::ErrorRate),
            "DECLINE_RATE" => Some(Self::DeclineRate),
            "TOTAL_VOLUME" => Some(Self::TotalVolume),
            _ => None,
        }
    }

    pub fn is_rate(&self) -> bool {
        !matches!(self, Self::TotalVolume)
    }

    /// Evaluation window in minutes: rates look back `rate_window`, volume is
    /// a one-minute metric.
    pub fn window_minutes(&self, rate_window: i64) -> i64 {
        if self.is_rate() {
            rate_window
        } else {
            1
        }
    }

    /// Which statuses count against this metric.
    pub fn adverse_statuses(&self) -> &'static [EventStatus] {
        match self {
            Self::ErrorRate => &[EventStatus::Error],
            Self::DeclineRate => &[EventStatus::Declined],
            Self::ApprovalRate => &[EventStatus::Declined, EventStatus::Error],
            Self::TotalVolume => &[],
        }
    }
}

/// Comparison between the observed value and the rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "<" => Some(Self::Lt),
            ">" => Some(Self::Gt),
            "<=" => Some(Self::Le),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn compare(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Self::Lt => observed < threshold,
            Self::Gt => observed > threshold,
            Self::Le => observed <= threshold,
            Self::Ge => observed >= threshold,
        }
    }
}

/// A stored alert rule. Immutable after creation apart from the `active`
/// flag (deletion is soft).
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    pub rule_id: Uuid,
    pub merchant_id: Option<String>,
    pub country: Option<String>,
    pub provider: Option<String>,
    pub issuer: Option<String>,
    pub metric_type: MetricType,
    pub operator: Operator,
    pub threshold: f64,
    pub min_transactions: u64,
    pub start_hour: Option<u8>,
    pub end_hour: Option<u8>,
    pub severity: Severity,
    pub min_consecutive_errors: Option<u64>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    /// Whether the rule applies at the given UTC hour. `[start, end)`, with
    /// wrap-around for overnight windows.
    pub fn applies_at_hour(&self, hour: u8) -> bool {
        match (self.start_hour, self.end_hour) {
            (Some(start), Some(end)) => {
                if start < end {
                    hour >= start && hour < end
                } else if start > end {
                    hour >= start || hour < end
                } else {
                    false
                }
            }
            _ => true,
        }
    }
}

/// Creation payload (HTTP body and CLI both build this).
#[derive(Debug, Clone, Deserialize)]
pub struct NewRule {
    #[serde(default)]
    pub merchant_id: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    pub metric_type: MetricType,
    pub operator: Operator,
    pub threshold: f64,
    #[serde(default = "default_min_transactions")]
    pub min_transactions: u64,
    #[serde(default)]
    pub start_hour: Option<u8>,
    #[serde(default)]
    pub end_hour: Option<u8>,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub min_consecutive_errors: Option<u64>,
}

fn default_min_transactions() -> u64 {
    30
}

fn default_severity() -> Severity {
    Severity::Warning
}

impl NewRule {
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            bail!("threshold must be finite and non-negative");
        }
        if self.metric_type.is_rate() && self.threshold > 1.0 {
            bail!("rate thresholds are fractions in [0, 1]");
        }
        if self.min_transactions == 0 {
            bail!("min_transactions must be at least 1");
        }
        if let Some(country) = &self.country {
            if country.len() != 2 || !country.bytes().all(|b| b.is_ascii_uppercase()) {
                bail!("country filter must be two uppercase letters");
            }
        }
        match (self.start_hour, self.end_hour) {
            (None, None) => {}
            (Some(s), Some(e)) => {
                if s > 23 || e > 23 {
                    bail!("hours must be in 0..=23");
                }
            }
            _ => bail!("start_hour and end_hour must be set together"),
        }
        Ok(())
    }
}

/// CRUD over alert rules. The detector never reads this directly; it works
/// from a periodically refreshed snapshot so new rules take effect after one
/// refresh interval.
#[derive(Clone)]
pub struct RuleRegistry {
    pool: Pool,
}

impl RuleRegistry {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn create(&self, new: &NewRule) -> Result<Rule> {
        new.validate()?;

        let rule = Rule {
            rule_id: Uuid::new_v4(),
            merchant_id: new.merchant_id.clone(),
            country: new.country.clone(),
            provider: new.provider.clone(),
            issuer: new.issuer.clone(),
            metric_type: new.metric_type,
            operator: new.operator,
            threshold: new.threshold,
            min_transactions: new.min_transactions,
            start_hour: new.start_hour,
            end_hour: new.end_hour,
            severity: new.severity,
            min_consecutive_errors: new.min_consecutive_errors,
            active: true,
            created_at: Utc::now(),
        };

        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO alert_rules (
                rule_id, merchant_id, filter_country, filter_provider, filter_issuer,
                metric_type, operator, threshold, min_transactions,
                start_hour, end_hour, severity, min_consecutive_errors,
                is_active, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 1, ?14)",
            params![
                rule.rule_id.to_string(),
                rule.merchant_id,
                rule.country,
                rule.provider,
                rule.issuer,
                rule.metric_type.as_str(),
                rule.operator.as_str(),
                rule.threshold,
                rule.min_transactions as i64,
                rule.start_hour.map(|h| h as i64),
                rule.end_hour.map(|h| h as i64),
                rule.severity.as_str(),
                rule.min_consecutive_errors.map(|n| n as i64),
                encode_ts(rule.created_at),
            ],
        )
        .context("failed to insert rule")?;

        Ok(rule)
    }

    pub fn list(&self) -> Result<Vec<Rule>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT rule_id, merchant_id, filter_country, filter_provider, filter_issuer,
                    metric_type, operator, threshold, min_transactions,
                    start_hour, end_hour, severity, min_consecutive_errors,
                    is_active, created_at
             FROM alert_rules ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_rule)?;

        let mut rules = Vec::new();
        for r in rows {
            rules.push(r?);
        }
        Ok(rules)
    }

    /// Active rules only, for the detector snapshot.
    pub fn load_active(&self) -> Result<Vec<Rule>> {
        Ok(self.list()?.into_iter().filter(|r| r.active).collect())
    }

    /// Soft delete: flips `is_active`. Returns false for an unknown id.
    pub fn soft_delete(&self, rule_id: Uuid) -> Result<bool> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE alert_rules SET is_active = 0 WHERE rule_id = ?1",
            params![rule_id.to_string()],
        )?;
        Ok(changed > 0)
    }
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let id_str: String = row.get(0)?;
    let metric_str: String = row.get(5)?;
    let op_str: String = row.get(6)?;
    let severity_str: String = row.get(11)?;
    let created_str: String = row.get(14)?;

    Ok(Rule {
        rule_id: Uuid::parse_str(&id_str).unwrap_or_default(),
        merchant_id: row.get(1)?,
        country: row.get(2)?,
        provider: row.get(3)?,
        issuer: row.get(4)?,
        metric_type: MetricType::parse(&metric_str).unwrap_or(MetricType::ErrorRate),
        operator: Operator::parse(&op_str).unwrap_or(Operator::Gt),
        threshold: row.get(7)?,
        min_transactions: row.get::<_, i64>(8)? as u64,
        start_hour: row.get::<_, Option<i64>>(9)?.map(|h| h as u8),
        end_hour: row.get::<_, Option<i64>>(10)?.map(|h| h as u8),
        severity: Severity::parse(&severity_str).unwrap_or(Severity::Warning),
        min_consecutive_errors: row.get::<_, Option<i64>>(12)?.map(|n| n as u64),
        active: row.get::<_, i64>(13)? != 0,
        created_at: decode_ts(&created_str).unwrap_or_else(Utc::now),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use r2d2_sqlite::SqliteConnectionManager;

    fn test_pool() -> Pool {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager).unwrap();
        crate::storage::schema::migrate(&pool.get().unwrap()).unwrap();
        pool
    }

    fn error_rate_rule() -> NewRule {
        NewRule {
            merchant_id: Some("merchant_shopito".to_string()),
            country: Some("MX".to_string()),
            provider: Some("STRIPE".to_string()),
            issuer: None,
            metric_type: MetricType::ErrorRate,
            operator: Operator::Gt,
            threshold: 0.10,
            min_transactions: 30,
            start_hour: None,
            end_hour: None,
            severity: Severity::Warning,
            min_consecutive_errors: None,
        }
    }

    #[test]
    fn test_create_list_roundtrip() {
        let registry = RuleRegistry::new(test_pool());
        let created = registry.create(&error_rate_rule()).unwrap();

        let rules = registry.list().unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule.rule_id, created.rule_id);
        assert_eq!(rule.metric_type, MetricType::ErrorRate);
        assert_eq!(rule.operator, Operator::Gt);
        assert_eq!(rule.threshold, 0.10);
        assert!(rule.active);
    }

    #[test]
    fn test_soft_delete_hides_from_active() {
        let registry = RuleRegistry::new(test_pool());
        let created = registry.create(&error_rate_rule()).unwrap();

        assert!(registry.soft_delete(created.rule_id).unwrap());
        assert!(registry.load_active().unwrap().is_empty());
        // Still listed for history.
        assert_eq!(registry.list().unwrap().len(), 1);
        // Unknown id reports false.
        assert!(!registry.soft_delete(Uuid::new_v4()).unwrap());
    }

    #[test]
    fn test_validation_rejects_bad_rules() {
        let registry = RuleRegistry::new(test_pool());

        let mut bad = error_rate_rule();
        bad.threshold = 1.5;
        assert!(registry.create(&bad).is_err());

        let mut bad = error_rate_rule();
        bad.country = Some("mex".to_string());
        assert!(registry.create(&bad).is_err());

        let mut bad = error_rate_rule();
        bad.start_hour = Some(9);
        assert!(registry.create(&bad).is_err());

        // Absolute-count thresholds above 1 are fine for volume rules.
        let mut volume = error_rate_rule();
        volume.metric_type = MetricType::TotalVolume;
        volume.operator = Operator::Lt;
        volume.threshold = 100.0;
        registry.create(&volume).unwrap();
    }

    #[test]
    fn test_operator_compare() {
        assert!(Operator::Gt.compare(0.3, 0.1));
        assert!(!Operator::Gt.compare(0.1, 0.1));
        assert!(Operator::Ge.compare(0.1, 0.1));
        assert!(Operator::Lt.compare(5.0, 100.0));
        assert!(Operator::Le.compare(100.0, 100.0));
    }

    #[test]
    fn test_time_window_wraps_midnight() {
        let mut rule_template = error_rate_rule();
        rule_template.start_hour = Some(22);
        rule_template.end_hour = Some(6);
        let registry = RuleRegistry::new(test_pool());
        let rule = registry.create(&rule_template).unwrap();

        assert!(rule.applies_at_hour(23));
        assert!(rule.applies_at_hour(3));
        assert!(!rule.applies_at_hour(12));
    }

    #[test]
    fn test_daytime_window() {
        let mut template = error_rate_rule();
        template.start_hour = Some(9);
        template.end_hour = Some(18);
        let registry = RuleRegistry::new(test_pool());
        let rule = registry.create(&template).unwrap();

        assert!(rule.applies_at_hour(9));
        assert!(rule.applies_at_hour(17));
        assert!(!rule.applies_at_hour(18));
        assert!(!rule.applies_at_hour(3));
    }
}
