use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::str::FromStr;

use crate::payments::error::PaymentError;

/// Final classification of a terminal transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Approved,
    Denied,
    Cancelled,
    Error,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Approved => "approved",
            PaymentStatus::Denied => "denied",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Error => "error",
        }
    }

    /// Classification of a numeric terminal result code.
    pub fn from_transaction_result(code: i64) -> Self {
        match code {
            0 => PaymentStatus::Approved,
            1..=99 => PaymentStatus::Denied,
            -1 => PaymentStatus::Cancelled,
            _ => PaymentStatus::Error,
        }
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "approved" => Ok(PaymentStatus::Approved),
            "denied" => Ok(PaymentStatus::Denied),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            "error" => Ok(PaymentStatus::Error),
            _ => Err(PaymentError::UnknownStatus(value.to_string())),
        }
    }
}

/// The notification path a result arrived on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    DirectCallback,
    InProcessEvent,
    StorageChange,
    Poller,
}

impl SourceChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceChannel::DirectCallback => "direct_callback",
            SourceChannel::InProcessEvent => "in_process_event",
            SourceChannel::StorageChange => "storage_change",
            SourceChannel::Poller => "poller",
        }
    }
}

impl std::fmt::Display for SourceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Untyped payload handed over by the payment bridge.
///
/// Field names and presence vary by channel and by bridge build, so the
/// payload is kept as a plain JSON object until the normalizer has seen it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "JsonValue", into = "JsonValue")]
pub struct RawResult(Map<String, JsonValue>);

impl RawResult {
    pub fn new(fields: Map<String, JsonValue>) -> Self {
        Self(fields)
    }

    /// Anything that is not a JSON object carries no usable fields.
    pub fn from_value(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(fields) => Self(fields),
            _ => Self::default(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&JsonValue> {
        self.0.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.0
    }
}

impl From<JsonValue> for RawResult {
    fn from(value: JsonValue) -> Self {
        RawResult::from_value(value)
    }
}

impl From<RawResult> for JsonValue {
    fn from(raw: RawResult) -> Self {
        JsonValue::Object(raw.0)
    }
}

/// Channel-independent representation of a payment outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalResult {
    pub status: PaymentStatus,
    /// Minor currency units.
    pub amount: Option<i64>,
    pub card_brand: Option<String>,
    pub nsu: Option<String>,
    pub authorization_code: Option<String>,
    pub response_code: Option<String>,
    pub message: Option<String>,
    pub merchant_receipt_text: Option<String>,
    pub customer_receipt_text: Option<String>,
    pub confirmation_id: Option<String>,
    pub requires_confirmation: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalResult {
    pub fn key(&self) -> ResultKey {
        ResultKey {
            status: self.status,
            nsu: self.nsu.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Whether the acquirer expects a follow-up confirmation call.
    pub fn needs_confirmation(&self) -> bool {
        self.requires_confirmation.unwrap_or(false) || self.confirmation_id.is_some()
    }
}

/// Dedup identity of a delivered result. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub status: PaymentStatus,
    pub nsu: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for ResultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.status,
            self.nsu.as_deref().unwrap_or("-"),
            self.timestamp.timestamp_millis()
        )
    }
}
