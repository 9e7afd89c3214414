//! Payment attempt endpoints used by the kiosk UI.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::api::AppState;
use crate::config::MAX_WAIT_CEILING;
use crate::error::{AppError, AppErrorKind, AppResult, DomainError};
use crate::middleware::error::with_request_id_from;
use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::CanonicalResult;
use crate::services::session::SessionPhase;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAttemptRequest {
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAttemptResponse {
    pub attempt_id: Uuid,
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptView {
    pub phase: SessionPhase,
    pub attempt_id: Option<Uuid>,
    pub max_wait_ms: u64,
    pub outcome: Option<CanonicalResult>,
}

#[derive(Debug, Clone)]
struct AttemptRecord {
    ticket: u64,
    attempt_id: Option<Uuid>,
    max_wait_ms: u64,
    outcome: Option<CanonicalResult>,
}

/// Remembers the latest attempt started over HTTP and its outcome, so the UI
/// can poll for it.
#[derive(Debug, Clone, Default)]
pub struct AttemptBoard {
    current: Arc<Mutex<Option<AttemptRecord>>>,
    next_ticket: Arc<AtomicU64>,
}

impl AttemptBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<AttemptRecord>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open(&self, max_wait_ms: u64) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        *self.lock() = Some(AttemptRecord {
            ticket,
            attempt_id: None,
            max_wait_ms,
            outcome: None,
        });
        ticket
    }

    fn bind(&self, ticket: u64, attempt_id: Uuid) {
        if let Some(record) = self.lock().as_mut().filter(|r| r.ticket == ticket) {
            record.attempt_id = Some(attempt_id);
        }
    }

    fn settle(&self, ticket: u64, result: CanonicalResult) {
        if let Some(record) = self.lock().as_mut().filter(|r| r.ticket == ticket) {
            record.outcome = Some(result);
        }
    }

    pub fn outcome(&self) -> Option<CanonicalResult> {
        self.lock().as_ref().and_then(|r| r.outcome.clone())
    }
}

/// Accepted range for a per-attempt max wait.
pub fn parse_max_wait(millis: u64) -> PaymentResult<Duration> {
    let max = MAX_WAIT_CEILING.as_millis() as u64;
    if millis == 0 || millis > max {
        return Err(PaymentError::InvalidMaxWait { millis, min: 1, max });
    }
    Ok(Duration::from_millis(millis))
}

/// POST /payments/attempts
pub async fn start_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<StartAttemptRequest>,
) -> AppResult<impl IntoResponse> {
    let max_wait = match request.max_wait_ms {
        Some(millis) => parse_max_wait(millis).map_err(|e| with_request_id_from(e, &headers))?,
        None => state.reconciler.default_max_wait(),
    };
    let max_wait_ms = max_wait.as_millis() as u64;

    let ticket = state.attempts.open(max_wait_ms);
    let board = state.attempts.clone();
    let attempt_id = state
        .reconciler
        .arm(move |result| board.settle(ticket, result), max_wait);
    state.attempts.bind(ticket, attempt_id);

    info!(attempt_id = %attempt_id, max_wait_ms, "payment attempt started over HTTP");
    Ok((
        StatusCode::CREATED,
        Json(StartAttemptResponse {
            attempt_id,
            max_wait_ms,
        }),
    ))
}

/// GET /payments/attempts/current
pub async fn current_attempt(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<AttemptView>> {
    let snapshot = state.reconciler.snapshot();
    let record = state.attempts.lock().clone();

    match record {
        Some(record) => Ok(Json(AttemptView {
            phase: snapshot.phase,
            attempt_id: record.attempt_id.or(snapshot.attempt_id),
            max_wait_ms: record.max_wait_ms,
            outcome: record.outcome,
        })),
        None if snapshot.phase != SessionPhase::Disabled => Ok(Json(AttemptView {
            phase: snapshot.phase,
            attempt_id: snapshot.attempt_id,
            max_wait_ms: snapshot.max_wait_ms,
            outcome: None,
        })),
        None => {
            let err = AppError::new(AppErrorKind::Domain(DomainError::NoActiveAttempt))
                .with_context("no payment attempt has been started");
            Err(with_request_id_from(err, &headers))
        }
    }
}

/// DELETE /payments/attempts/current
pub async fn cancel_attempt(State(state): State<AppState>) -> StatusCode {
    state.reconciler.disarm();
    StatusCode::NO_CONTENT
}
