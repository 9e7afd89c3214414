//! Ingress for the native payment bridge.
//!
//! Every endpoint answers 200 for a well-formed delivery, accepted or not:
//! discarded results (disarmed, duplicate, late) are normal bridge noise.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::api::AppState;
use crate::cache::slot::SlotEntry;
use crate::error::AppResult;
use crate::middleware::error::with_request_id_from;
use crate::payments::error::PaymentError;
use crate::payments::types::RawResult;
use crate::services::event_bus::PAYMENT_RESULT_EVENT;

/// Body field the bridge may use to stamp its own slot write time.
const WRITTEN_AT_FIELD: &str = "writtenAt";

#[derive(Debug, Serialize)]
pub struct DeliveryAck {
    pub status: &'static str,
    pub accepted: bool,
}

impl DeliveryAck {
    fn new(accepted: bool) -> Self {
        Self {
            status: "ok",
            accepted,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct BridgeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub detail: JsonValue,
}

/// POST /bridge/callback
pub async fn direct_callback(
    State(state): State<AppState>,
    Json(payload): Json<JsonValue>,
) -> impl IntoResponse {
    let accepted = state
        .listener
        .direct_callback()
        .invoke(RawResult::from_value(payload));
    debug!(accepted, "bridge direct callback");
    (StatusCode::OK, Json(DeliveryAck::new(accepted)))
}

/// POST /bridge/events
pub async fn post_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<BridgeEvent>,
) -> AppResult<impl IntoResponse> {
    if event.event_type != PAYMENT_RESULT_EVENT {
        let err = PaymentError::UnknownEvent(event.event_type);
        return Err(with_request_id_from(err, &headers));
    }

    let accepted = state.listener.post_event(RawResult::from_value(event.detail));
    debug!(accepted, "bridge in-process event");
    Ok((StatusCode::OK, Json(DeliveryAck::new(accepted))))
}

/// PUT /bridge/slot
///
/// Stores the result in the durable slot. Delivery happens through the slot's
/// change notification (or the poller), not in this request.
pub async fn write_slot(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<JsonValue>,
) -> AppResult<impl IntoResponse> {
    let entry = slot_entry_from_body(payload);
    let written_at = entry.written_at;
    state
        .slot
        .write(entry)
        .await
        .map_err(|e| with_request_id_from(e, &headers))?;

    info!(
        written_at = %written_at,
        backend = state.slot.backend(),
        "payment result stored in slot"
    );
    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok", "writtenAt": written_at })),
    ))
}

/// Split an optional `writtenAt` stamp off the raw payload.
fn slot_entry_from_body(payload: JsonValue) -> SlotEntry {
    let mut raw = RawResult::from_value(payload);
    let written_at = raw
        .get(WRITTEN_AT_FIELD)
        .and_then(JsonValue::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| ts.with_timezone(&Utc));

    if written_at.is_some() {
        let mut fields = raw.fields().clone();
        fields.remove(WRITTEN_AT_FIELD);
        raw = RawResult::new(fields);
    }

    SlotEntry::written_at(raw, written_at.unwrap_or_else(Utc::now))
}
