//! Ingestor: validate inbound events, persist them durably, fan out the
//! bucketed counters.
//!
//! The event log append is the commit point. Counter updates happen after it
//! and are best-effort; the log is the source of truth and the aggregates
//! are rebuildable in principle.

pub mod event;
pub mod fx;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::metrics::{self, MemoryMetricStore};
use crate::storage::{self, Pool};

/// Hard deadline on the durable append.
const APPEND_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("ingest queue saturated, retry later")]
    Backpressure,

    #[error("event log append timed out")]
    Deadline,

    #[error("event log append failed: {0}")]
    Storage(String),
}

impl IngestError {
    /// Whether a client may retry the same request unchanged.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Backpressure | Self::Deadline | Self::Storage(_))
    }
}

/// Successful ingest receipt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Accepted {
    pub event_id: String,
    pub accepted_at: DateTime<Utc>,
}

pub struct Ingestor {
    pool: Pool,
    store: Arc<MemoryMetricStore>,
    permits: Semaphore,
    last_received_us: AtomicI64,
}

impl Ingestor {
    pub fn new(pool: Pool, store: Arc<MemoryMetricStore>, max_in_flight: usize) -> Self {
        Self {
            pool,
            store,
            permits: Semaphore::new(max_in_flight),
            last_received_us: AtomicI64::new(0),
        }
    }

    /// Server-assigned receive timestamp, clamped so it never moves backwards
    /// within this instance even if the wall clock does.
    fn monotonic_now(&self) -> DateTime<Utc> {
        let now_us = Utc::now().timestamp_micros();
        let prev = self.last_received_us.fetch_max(now_us, Ordering::AcqRel);
        let clamped = now_us.max(prev);
        DateTime::from_timestamp_micros(clamped).unwrap_or_else(Utc::now)
    }

    /// Validate, persist, and count one raw event body.
    pub async fn ingest(&self, raw: &[u8]) -> Result<Accepted, IngestError> {
        let _permit = self
            .permits
            .try_acquire()
            .map_err(|_| IngestError::Backpressure)?;

        let received_at = self.monotonic_now();
        let stored = event::validate(raw, received_at)?;

        let pool = self.pool.clone();
        let to_append = stored.clone();
        let append = tokio::task::spawn_blocking(move || -> Result<(), IngestError> {
            let conn = pool
                .get()
                .map_err(|e| IngestError::Storage(e.to_string()))?;
            storage::events::append(&conn, &to_append)
                .map_err(|e| IngestError::Storage(e.to_string()))
        });

        match tokio::time::timeout(APPEND_DEADLINE, append).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => return Err(IngestError::Storage(join_err.to_string())),
            Err(_) => return Err(IngestError::Deadline),
        }

        // The event is committed; counters are fire-and-forget from here.
        metrics::record_event(&self.store, &stored);

        tracing::debug!(
            event_id = %stored.event_id,
            provider = %stored.provider_id,
            status = stored.status.as_str(),
            "event ingested"
        );

        Ok(Accepted {
            event_id: stored.event_id,
            accepted_at: received_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::minute_bucket;
    use r2d2_sqlite::SqliteConnectionManager;

    fn test_pool() -> Pool {
        let manager = SqliteConnectionManager::memory();
        let pool = r2d2::Pool::builder().max_size(1).build(manager).unwrap();
        crate::storage::schema::migrate(&pool.get().unwrap()).unwrap();
        pool
    }

    fn sample_body(id: &str, status: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "id": id,
            "merchant_id": "merchant_shopito",
            "country": "MX",
            "status": status,
            "amount": {"value": 100.0, "currency": "USD"},
            "provider_data": {"id": "STRIPE", "response_code": "504"},
            "latency_ms": 300
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_persists_and_counts() {
        let pool = test_pool();
        let store = Arc::new(MemoryMetricStore::new(1800));
        let ingestor = Ingestor::new(pool.clone(), store.clone(), 16);

        let accepted = ingestor.ingest(&sample_body("evt-1", "ERROR")).await.unwrap();
        assert_eq!(accepted.event_id, "evt-1");

        // Durable record, byte-for-byte payload.
        let conn = pool.get().unwrap();
        let raw = storage::events::raw_payload(&conn, "evt-1").unwrap().unwrap();
        assert_eq!(raw.as_bytes(), sample_body("evt-1", "ERROR").as_slice());

        // Counters visible in the current bucket, including the rc/ side key.
        let bucket = minute_bucket(accepted.accepted_at);
        let range = bucket..bucket + 1;
        assert_eq!(store.sum("merchant_shopito/MX/STRIPE/_/ERROR", range.clone()), 1);
        assert_eq!(store.sum("_/MX/STRIPE/_/ERROR", range.clone()), 1);
        assert_eq!(store.sum("rc/merchant_shopito/MX/STRIPE/504", range), 1);
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let pool = test_pool();
        let store = Arc::new(MemoryMetricStore::new(1800));
        let ingestor = Ingestor::new(pool.clone(), store.clone(), 16);

        let mut body: serde_json::Value =
            serde_json::from_slice(&sample_body("evt-2", "ERROR")).unwrap();
        body["country"] = "mexico".into();
        let err = ingestor
            .ingest(&serde_json::to_vec(&body).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation { field: "country", .. }));

        let conn = pool.get().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_backpressure_when_saturated() {
        let pool = test_pool();
        let store = Arc::new(MemoryMetricStore::new(1800));
        let ingestor = Ingestor::new(pool, store, 1);

        // Hold the only permit, then the next request must bounce.
        let _held = ingestor.permits.try_acquire().unwrap();
        let err = ingestor.ingest(&sample_body("evt-3", "SUCCEEDED")).await.unwrap_err();
        assert!(matches!(err, IngestError::Backpressure));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_received_at_is_monotonic() {
        let pool = test_pool();
        let store = Arc::new(MemoryMetricStore::new(1800));
        let ingestor = Ingestor::new(pool, store, 16);

        let mut last = ingestor.monotonic_now();
        for _ in 0..100 {
            let next = ingestor.monotonic_now();
            assert!(next >= last);
            last = next;
        }
    }
}
