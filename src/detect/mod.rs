//! Anomaly detection: rule evaluation, trend/recovery logic, incident
//! lifecycle.

pub mod engine;
pub mod incident;
pub mod trend;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("detector lease is held by another instance")]
    LeaseHeld,

    #[error("storage: {0}")]
    Storage(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Severity levels for rules and the incidents they open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "WARNING",
            Self::Critical => "CRITICAL",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "WARNING" => Some(Self::Warning),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Incident lifecycle states.
///
/// OPEN -> ENRICHING -> NOTIFIED is the happy path; RECOVERED closes an
/// episode on healthy traffic; SUPPRESSED marks a re-fire inside the
/// cooldown window and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentState {
    Open,
    Enriching,
    Notified,
    Recovered,
    Suppressed,
}

impl IncidentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Enriching => "ENRICHING",
            Self::Notified => "NOTIFIED",
            Self::Recovered => "RECOVERED",
            Self::Suppressed => "SUPPRESSED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "OPEN" => Some(Self::Open),
            "ENRICHING" => Some(Self::Enriching),
            "NOTIFIED" => Some(Self::Notified),
            "RECOVERED" => Some(Self::Recovered),
            "SUPPRESSED" => Some(Self::Suppressed),
            _ => None,
        }
    }

    /// States counted as an active episode for deduplication.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Open | Self::Enriching | Self::Notified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentStatus {
    Pending,
    Succeeded,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Structured description of the traffic slice an incident blames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCause {
    pub merchant: Option<String>,
    pub country: Option<String>,
    pub provider: Option<String>,
    pub issue: String,
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<String>,
}

/// Structured operator recommendation attached to an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub label: String,
    pub action_type: String,
}

/// A full incident row as stored and served.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentRecord {
    pub incident_id: Uuid,
    pub rule_id: Uuid,
    pub dimension_key: String,
    pub state: IncidentState,
    pub severity: Severity,
    pub opened_at: DateTime<Utc>,
    pub last_evaluated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub observed_value: f64,
    pub affected_transactions: u64,
    pub revenue_at_risk_usd: f64,
    pub response_code_breakdown: serde_json::Value,
    pub root_cause: serde_json::Value,
    pub llm_explanation: Option<String>,
    pub suggested_action: serde_json::Value,
    pub enrichment_status: EnrichmentStatus,
    pub confidence_score: f64,
    pub sla_breach_countdown_seconds: Option<i64>,
}
