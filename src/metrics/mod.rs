//! Bucketed metric counters and the dimension-key grammar.
//!
//! A dimension key is an opaque slash-separated string naming a slice of
//! traffic: `merchant/country/provider/issuer` with `_` in every position the
//! slice aggregates over, plus a trailing status segment on the stored
//! counter keys. Error response codes get side counters under the `rc/`
//! namespace.

pub mod memory;

pub use memory::MemoryMetricStore;

use chrono::{DateTime, Utc};

use crate::ingest::event::{EventStatus, StoredEvent};

/// Placeholder for an aggregated-over slot in a dimension key.
pub const WILDCARD: &str = "_";

/// Namespace prefix for per-response-code side counters.
pub const RESPONSE_CODE_NS: &str = "rc";

/// Counters are bucketed per minute. This is a documented invariant; nothing
/// below assumes sub-minute precision.
pub const BUCKET_SECONDS: i64 = 60;

/// Minute bucket for a timestamp.
pub fn minute_bucket(ts: DateTime<Utc>) -> i64 {
    ts.timestamp().div_euclid(BUCKET_SECONDS)
}

/// A parsed dimension prefix (everything before the status segment).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Dimension {
    pub merchant: Option<String>,
    pub country: Option<String>,
    pub provider: Option<String>,
    pub issuer: Option<String>,
}

impl Dimension {
    /// Render back to the canonical `m/c/p/i` prefix.
    pub fn prefix(&self) -> String {
        fn slot(v: &Option<String>) -> &str {
            v.as_deref().unwrap_or(WILDCARD)
        }
        format!(
            "{}/{}/{}/{}",
            slot(&self.merchant),
            slot(&self.country),
            slot(&self.provider),
            slot(&self.issuer)
        )
    }

    /// Parse an `m/c/p/i` prefix. Returns None for malformed input.
    pub fn parse(prefix: &str) -> Option<Self> {
        let parts: Vec<&str> = prefix.split('/').collect();
        if parts.len() != 4 || parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        let slot = |p: &str| {
            if p == WILDCARD {
                None
            } else {
                Some(p.to_string())
            }
        };
        Some(Self {
            merchant: slot(parts[0]),
            country: slot(parts[1]),
            provider: slot(parts[2]),
            issuer: slot(parts[3]),
        })
    }

    /// Full counter key for one status within this slice.
    pub fn status_key(&self, status: EventStatus) -> String {
        format!("{}/{}", self.prefix(), status.as_str())
    }
}

/// The pre-declared dimension keys an event increments, status embedded.
pub fn status_keys(event: &StoredEvent) -> Vec<String> {
    let status = event.status.as_str();
    let m = &event.merchant_id;
    let c = &event.country;
    let p = &event.provider_id;

    let mut keys = vec![
        format!("{m}/_/_/_/{status}"),
        format!("{m}/{c}/_/_/{status}"),
        format!("{m}/{c}/{p}/_/{status}"),
        format!("_/{c}/{p}/_/{status}"),
    ];
    if let Some(issuer) = &event.issuer_name {
        keys.push(format!("{m}/{c}/{p}/{issuer}/{status}"));
    }
    keys
}

/// Side-counter key for an ERROR event's response code.
pub fn response_code_key(event: &StoredEvent, code: &str) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        RESPONSE_CODE_NS, event.merchant_id, event.country, event.provider_id, code
    )
}

/// Fan an accepted event out to every declared counter. The event log is the
/// source of truth; these are best-effort aggregates.
pub fn record_event(store: &MemoryMetricStore, event: &StoredEvent) {
    let bucket = minute_bucket(event.received_at);
    for key in status_keys(event) {
        store.incr(&key, bucket);
    }
    if event.status == EventStatus::Error {
        if let Some(code) = &event.response_code {
            store.incr(&response_code_key(event, code), bucket);
        }
    }
}
