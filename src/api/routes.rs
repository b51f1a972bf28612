//! HTTP handlers.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use crate::detect::IncidentState;
use crate::ingest::IngestError;
use crate::metrics::minute_bucket;
use crate::rules::NewRule;
use crate::storage::decode_ts;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let pool = state.pool.clone();
    let db_ok = tokio::task::spawn_blocking(move || {
        pool.get()
            .ok()
            .and_then(|conn| conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)).ok())
            .is_some()
    })
    .await
    .unwrap_or(false);

    Json(json!({
        "status": if db_ok { "healthy" } else { "degraded" },
        "database": if db_ok { "connected" } else { "disconnected" },
        "metric_buckets": state.store.len(),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

pub async fn ingest(State(state): State<AppState>, body: Bytes) -> Response {
    match state.ingestor.ingest(&body).await {
        Ok(accepted) => (StatusCode::OK, Json(json!(accepted))).into_response(),
        Err(IngestError::Validation { field, message }) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": message, "field": field})),
        )
            .into_response(),
        Err(err @ (IngestError::Backpressure | IngestError::Deadline)) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": err.to_string(), "retriable": true})),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(error = %err, "ingest failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": err.to_string()})),
            )
                .into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

pub async fn list_rules(State(state): State<AppState>) -> Response {
    let registry = state.registry.clone();
    match tokio::task::spawn_blocking(move || registry.list()).await {
        Ok(Ok(rules)) => {
            let total = rules.len();
            Json(json!({"rules": rules, "total": total})).into_response()
        }
        Ok(Err(e)) => storage_error(e),
        Err(e) => storage_error(e.into()),
    }
}

pub async fn create_rule(State(state): State<AppState>, Json(new): Json<NewRule>) -> Response {
    let registry = state.registry.clone();
    match tokio::task::spawn_blocking(move || registry.create(&new)).await {
        Ok(Ok(rule)) => {
            tracing::info!(rule_id = %rule.rule_id, metric = rule.metric_type.as_str(), "rule created");
            (StatusCode::OK, Json(json!(rule))).into_response()
        }
        Ok(Err(e)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
        Err(e) => storage_error(e.into()),
    }
}

pub async fn delete_rule(State(state): State<AppState>, Path(rule_id): Path<Uuid>) -> Response {
    let registry = state.registry.clone();
    match tokio::task::spawn_blocking(move || registry.soft_delete(rule_id)).await {
        Ok(Ok(true)) => Json(json!({"deleted": rule_id.to_string()})).into_response(),
        Ok(Ok(false)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown rule id"})),
        )
            .into_response(),
        Ok(Err(e)) => storage_error(e),
        Err(e) => storage_error(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    since: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Response {
    let since: Option<DateTime<Utc>> = match &query.since {
        Some(raw) => match decode_ts(raw) {
            Some(ts) => Some(ts),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "since must be an RFC 3339 timestamp"})),
                )
                    .into_response()
            }
        },
        None => None,
    };

    let states: Option<Vec<IncidentState>> = match &query.state {
        Some(raw) => {
            let parsed: Vec<IncidentState> = raw
                .split(',')
                .filter_map(|s| IncidentState::parse(s.trim()))
                .collect();
            if parsed.is_empty() {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "no valid states in filter"})),
                )
                    .into_response();
            }
            Some(parsed)
        }
        None => None,
    };

    let limit = query.limit.unwrap_or(100).min(1000);
    let incidents = state.incidents.clone();
    match tokio::task::spawn_blocking(move || incidents.query(since, states.as_deref(), limit))
        .await
    {
        Ok(Ok(alerts)) => {
            let total = alerts.len();
            Json(json!({"alerts": alerts, "total": total})).into_response()
        }
        Ok(Err(e)) => storage_error(e),
        Err(e) => storage_error(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RecentMetricsQuery {
    #[serde(default)]
    minutes: Option<i64>,
}

pub async fn recent_metrics(
    State(state): State<AppState>,
    Query(query): Query<RecentMetricsQuery>,
) -> Json<Value> {
    let minutes = query.minutes.unwrap_or(5).clamp(1, 120);
    let now_bucket = minute_bucket(Utc::now());
    let range = (now_bucket - minutes + 1)..(now_bucket + 1);

    // Aggregate only the global per-country/provider slices so each event is
    // counted exactly once.
    #[derive(Default, Clone, Copy)]
    struct Tally {
        total: u64,
        terminal: u64,
        succeeded: u64,
        error: u64,
    }
    let mut per_bucket: std::collections::BTreeMap<i64, Tally> = std::collections::BTreeMap::new();

    for (key, bucket, count) in state.store.scan(range) {
        let parts: Vec<&str> = key.split('/').collect();
        if parts.len() != 5 || parts[0] != "_" {
            continue;
        }
        let tally = per_bucket.entry(bucket).or_default();
        tally.total += count;
        match parts[4] {
            "SUCCEEDED" => {
                tally.terminal += count;
                tally.succeeded += count;
            }
            "ERROR" => {
                tally.terminal += count;
                tally.error += count;
            }
            "DECLINED" => tally.terminal += count,
            _ => {}
        }
    }

    let snapshots: Vec<Value> = per_bucket
        .into_iter()
        .map(|(bucket, tally)| {
            let timestamp = DateTime::from_timestamp(bucket * 60, 0).unwrap_or_else(Utc::now);
            let (approval, error) = if tally.terminal > 0 {
                (
                    tally.succeeded as f64 / tally.terminal as f64,
                    tally.error as f64 / tally.terminal as f64,
                )
            } else {
                (0.0, 0.0)
            };
            json!({
                "timestamp": timestamp.to_rfc3339(),
                "total_count": tally.total,
                "approval_rate": approval,
                "error_rate": error,
            })
        })
        .collect();

    Json(json!({"minutes": minutes, "snapshots": snapshots}))
}

fn storage_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "storage operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "storage unavailable"})),
    )
        .into_response()
}
