//! Wire schema and validation for inbound payment events.
//!
//! The wire struct is deliberately loose (strings, optional nesting) so the
//! parser can name the offending field on rejection; `StoredEvent` is the
//! strict typed record the rest of the core works with. The raw body is
//! carried through untouched for the event log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fx;
use super::IngestError;

/// Terminal and non-terminal transaction outcomes. Closed set; anything else
/// is rejected at the door.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Created,
    Succeeded,
    Declined,
    Error,
    Rejected,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Succeeded => "SUCCEEDED",
            Self::Declined => "DECLINED",
            Self::Error => "ERROR",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CREATED" => Some(Self::Created),
            "SUCCEEDED" => Some(Self::Succeeded),
            "DECLINED" => Some(Self::Declined),
            "ERROR" => Some(Self::Error),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire schema
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct WireEvent {
    pub id: String,
    pub merchant_id: String,
    pub country: String,
    pub status: String,
    #[serde(default)]
    pub sub_status: Option<String>,
    pub amount: WireAmount,
    #[serde(default)]
    pub payment_method: Option<WirePaymentMethod>,
    pub provider_data: WireProviderData,
    #[serde(default)]
    pub latency_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WireAmount {
    pub value: f64,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
pub struct WirePaymentMethod {
    #[serde(default)]
    pub detail: Option<WireDetail>,
}

#[derive(Debug, Deserialize)]
pub struct WireDetail {
    #[serde(default)]
    pub card: Option<WireCard>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WireCard {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub issuer_name: Option<String>,
    #[serde(default)]
    pub bin: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WireProviderData {
    pub id: String,
    #[serde(default)]
    pub merchant_advice_code: Option<String>,
    #[serde(default)]
    pub response_code: Option<String>,
}

// ---------------------------------------------------------------------------
// Stored record
// ---------------------------------------------------------------------------

/// The validated, immutable event as it lands in the event log.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub event_id: String,
    pub received_at: DateTime<Utc>,
    pub merchant_id: String,
    pub provider_id: String,
    pub country: String,
    pub status: EventStatus,
    pub sub_status: Option<String>,
    pub amount_usd: f64,
    pub issuer_name: Option<String>,
    pub card_brand: Option<String>,
    pub bin: Option<String>,
    pub response_code: Option<String>,
    pub merchant_advice_code: Option<String>,
    pub latency_ms: i64,
    /// Inbound JSON preserved byte-for-byte.
    pub raw_payload: String,
}

fn invalid(field: &'static str, message: impl Into<String>) -> IngestError {
    IngestError::Validation {
        field,
        message: message.into(),
    }
}

/// Parse and validate a raw request body into a `StoredEvent`.
///
/// `received_at` is the server-assigned timestamp; the caller guarantees it
/// is monotonically non-decreasing within this ingestor instance.
pub fn validate(raw: &[u8], received_at: DateTime<Utc>) -> Result<StoredEvent, IngestError> {
    let wire: WireEvent = serde_json::from_slice(raw)
        .map_err(|e| invalid("body", format!("malformed event payload: {e}")))?;

    if wire.id.trim().is_empty() {
        return Err(invalid("id", "event identifier must be non-empty"));
    }
    if wire.merchant_id.trim().is_empty() {
        return Err(invalid("merchant_id", "must be non-empty"));
    }
    if wire.provider_data.id.trim().is_empty() {
        return Err(invalid("provider_data.id", "must be non-empty"));
    }

    let status = EventStatus::parse(&wire.status)
        .ok_or_else(|| invalid("status", format!("unknown status {:?}", wire.status)))?;

    if wire.country.len() != 2 || !wire.country.bytes().all(|b| b.is_ascii_uppercase()) {
        return Err(invalid(
            "country",
            format!("expected two uppercase letters, got {:?}", wire.country),
        ));
    }

    if !wire.amount.value.is_finite() || wire.amount.value < 0.0 {
        return Err(invalid(
            "amount.value",
            format!("must be finite and non-negative, got {}", wire.amount.value),
        ));
    }

    let amount_usd = fx::convert_to_usd(wire.amount.value, &wire.amount.currency)
        .ok_or_else(|| invalid("amount.currency", format!("unknown currency {:?}", wire.amount.currency)))?;

    let latency_ms = wire.latency_ms.unwrap_or(0);
    if latency_ms < 0 {
        return Err(invalid("latency_ms", "must be non-negative"));
    }

    let card = wire
        .payment_method
        .and_then(|pm| pm.detail)
        .and_then(|d| d.card)
        .unwrap_or_default();

    let raw_payload = String::from_utf8(raw.to_vec())
        .map_err(|_| invalid("body", "payload is not valid UTF-8"))?;

    Ok(StoredEvent {
        event_id: wire.id,
        received_at,
        merchant_id: wire.merchant_id,
        provider_id: wire.provider_data.id,
        country: wire.country,
        status,
        sub_status: wire.sub_status,
        amount_usd,
        issuer_name: card.issuer_name,
        card_brand: card.brand,
        bin: card.bin,
        response_code: wire.provider_data.response_code,
        merchant_advice_code: wire.provider_data.merchant_advice_code,
        latency_ms,
        raw_payload,
    })
}

/// Minimal stored event for unit tests elsewhere in the crate.
#[cfg(test)]
pub fn test_event(merchant: &str, country: &str, provider: &str, status: EventStatus) -> StoredEvent {
    StoredEvent {
        event_id: uuid::Uuid::new_v4().to_string(),
        received_at: Utc::now(),
        merchant_id: merchant.to_string(),
        provider_id: provider.to_string(),
        country: country.to_string(),
        status,
        sub_status: None,
        amount_usd: 100.0,
        issuer_name: None,
        card_brand: Some("VISA".to_string()),
        bin: Some("424242".to_string()),
        response_code: None,
        merchant_advice_code: None,
        latency_ms: 250,
        raw_payload: "{}".to_string(),
    }
}
