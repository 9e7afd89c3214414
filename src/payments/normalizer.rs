//! Maps bridge payloads of any known shape onto [`CanonicalResult`].
//!
//! The bridge is not stable across native builds, so every accepted spelling of
//! a field lives in one alias table per canonical field. Normalization never
//! fails: a payload that cannot be classified becomes `PaymentStatus::Error`.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;

use crate::payments::types::{CanonicalResult, PaymentStatus, RawResult};

/// Epoch values below this are read as seconds, otherwise milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    Status,
    TransactionResult,
    Amount,
    CardBrand,
    Nsu,
    AuthorizationCode,
    ResponseCode,
    Message,
    MerchantReceiptText,
    CustomerReceiptText,
    ConfirmationId,
    RequiresConfirmation,
    Timestamp,
    CancelledFlag,
}

impl CanonicalField {
    pub const ALL: [CanonicalField; 14] = [
        CanonicalField::Status,
        CanonicalField::TransactionResult,
        CanonicalField::Amount,
        CanonicalField::CardBrand,
        CanonicalField::Nsu,
        CanonicalField::AuthorizationCode,
        CanonicalField::ResponseCode,
        CanonicalField::Message,
        CanonicalField::MerchantReceiptText,
        CanonicalField::CustomerReceiptText,
        CanonicalField::ConfirmationId,
        CanonicalField::RequiresConfirmation,
        CanonicalField::Timestamp,
        CanonicalField::CancelledFlag,
    ];

    /// Raw field names accepted for this field, in lookup order.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            CanonicalField::Status => &["status", "paymentStatus", "state"],
            CanonicalField::TransactionResult => {
                &["transactionResult", "transaction_result", "resultCode"]
            }
            CanonicalField::Amount => &["amount", "amountInCents", "value"],
            CanonicalField::CardBrand => &["cardBrand", "card_brand", "brand"],
            CanonicalField::Nsu => &["nsu", "transactionNsu", "hostNsu"],
            CanonicalField::AuthorizationCode => {
                &["authorizationCode", "authorization_code", "authCode"]
            }
            CanonicalField::ResponseCode => {
                &["responseCode", "response_code", "terminalResponseCode"]
            }
            CanonicalField::Message => &["message", "resultMessage", "displayMessage"],
            CanonicalField::MerchantReceiptText => {
                &["merchantReceiptText", "merchantReceipt", "merchant_receipt"]
            }
            CanonicalField::CustomerReceiptText => {
                &["customerReceiptText", "customerReceipt", "customer_receipt"]
            }
            CanonicalField::ConfirmationId => {
                &["confirmationId", "confirmationTransactionId", "confirmation_id"]
            }
            CanonicalField::RequiresConfirmation => {
                &["requiresConfirmation", "requires_confirmation", "pendingConfirmation"]
            }
            CanonicalField::Timestamp => &["timestamp", "createdAt", "transactionTimestamp"],
            CanonicalField::CancelledFlag => &["cancelled", "canceled", "userCancelled"],
        }
    }
}

/// Normalize using the current time as the timestamp fallback.
pub fn normalize(raw: &RawResult) -> CanonicalResult {
    normalize_at(raw, Utc::now())
}

/// A numeric terminal result code as found in the payload.
#[derive(Debug, Clone, PartialEq)]
enum ResultCode {
    Integer(i64),
    /// Numeric, but not a whole number that fits an `i64`.
    Other(String),
}

impl ResultCode {
    fn status(&self) -> PaymentStatus {
        match self {
            ResultCode::Integer(code) => PaymentStatus::from_transaction_result(*code),
            ResultCode::Other(_) => PaymentStatus::Error,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Integer(code) => write!(f, "{}", code),
            ResultCode::Other(text) => f.write_str(text),
        }
    }
}

/// Normalize with an explicit timestamp fallback for payloads that carry none.
pub fn normalize_at(raw: &RawResult, fallback_timestamp: DateTime<Utc>) -> CanonicalResult {
    let transaction_result = result_code_field(raw, CanonicalField::TransactionResult);
    let nsu = text_field(raw, CanonicalField::Nsu);
    let authorization_code = text_field(raw, CanonicalField::AuthorizationCode);

    let status = canonical_status(raw)
        .or_else(|| transaction_result.as_ref().map(ResultCode::status))
        .unwrap_or_else(|| {
            if nsu.is_some() || authorization_code.is_some() {
                PaymentStatus::Approved
            } else if flag_field(raw, CanonicalField::CancelledFlag).unwrap_or(false) {
                PaymentStatus::Cancelled
            } else {
                PaymentStatus::Error
            }
        });

    let response_code = text_field(raw, CanonicalField::ResponseCode)
        .or_else(|| transaction_result.as_ref().map(ResultCode::to_string));

    CanonicalResult {
        status,
        amount: integer_field(raw, CanonicalField::Amount),
        card_brand: text_field(raw, CanonicalField::CardBrand),
        nsu,
        authorization_code,
        response_code,
        message: text_field(raw, CanonicalField::Message),
        merchant_receipt_text: text_field(raw, CanonicalField::MerchantReceiptText),
        customer_receipt_text: text_field(raw, CanonicalField::CustomerReceiptText),
        confirmation_id: text_field(raw, CanonicalField::ConfirmationId),
        requires_confirmation: flag_field(raw, CanonicalField::RequiresConfirmation),
        timestamp: timestamp_field(raw, CanonicalField::Timestamp).unwrap_or(fallback_timestamp),
    }
}

fn canonical_status(raw: &RawResult) -> Option<PaymentStatus> {
    text_field(raw, CanonicalField::Status).and_then(|s| s.parse().ok())
}

/// First alias that is present, not null and not a blank string.
fn lookup<'a>(raw: &'a RawResult, field: CanonicalField) -> Option<&'a JsonValue> {
    field
        .aliases()
        .iter()
        .filter_map(|alias| raw.get(alias))
        .find(|value| match value {
            JsonValue::Null => false,
            JsonValue::String(s) => !s.trim().is_empty(),
            _ => true,
        })
}

fn text_field(raw: &RawResult, field: CanonicalField) -> Option<String> {
    match lookup(raw, field)? {
        JsonValue::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn integer_field(raw: &RawResult, field: CanonicalField) -> Option<i64> {
    match result_code_field(raw, field)? {
        ResultCode::Integer(value) => Some(value),
        ResultCode::Other(_) => None,
    }
}

/// Any numeric value; `None` only for absent or non-numeric fields.
fn result_code_field(raw: &RawResult, field: CanonicalField) -> Option<ResultCode> {
    match lookup(raw, field)? {
        JsonValue::Number(n) => Some(
            whole_number(n.as_i64(), n.as_f64())
                .map_or_else(|| ResultCode::Other(n.to_string()), ResultCode::Integer),
        ),
        JsonValue::String(s) => {
            let text = s.trim();
            if let Ok(value) = text.parse::<i64>() {
                return Some(ResultCode::Integer(value));
            }
            let float = text.parse::<f64>().ok().filter(|f| f.is_finite())?;
            Some(
                whole_number(None, Some(float))
                    .map_or_else(|| ResultCode::Other(text.to_string()), ResultCode::Integer),
            )
        }
        _ => None,
    }
}

fn whole_number(integer: Option<i64>, float: Option<f64>) -> Option<i64> {
    integer.or_else(|| {
        float
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

fn flag_field(raw: &RawResult, field: CanonicalField) -> Option<bool> {
    match lookup(raw, field)? {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => n.as_i64().map(|v| v != 0),
        JsonValue::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn timestamp_field(raw: &RawResult, field: CanonicalField) -> Option<DateTime<Utc>> {
    match lookup(raw, field)? {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| s.trim().parse::<i64>().ok().and_then(from_epoch)),
        JsonValue::Number(n) => n.as_i64().and_then(from_epoch),
        _ => None,
    }
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() < EPOCH_MILLIS_THRESHOLD {
        Utc.timestamp_opt(value, 0).single()
    } else {
        Utc.timestamp_millis_opt(value).single()
    }
}
