pub mod attempts;
pub mod bridge;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::cache::slot::DurableSlot;
use crate::health::{HealthChecker, HealthState};
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::listener::MultiChannelListener;
use crate::services::reconciler::PaymentReconciler;

pub use attempts::AttemptBoard;

#[derive(Clone)]
pub struct AppState {
    pub reconciler: PaymentReconciler,
    pub listener: Arc<MultiChannelListener>,
    pub slot: Arc<dyn DurableSlot>,
    pub attempts: AttemptBoard,
    pub health_checker: HealthChecker,
}

impl AppState {
    pub fn new(reconciler: PaymentReconciler, listener: Arc<MultiChannelListener>) -> Self {
        let slot = Arc::clone(listener.slot());
        Self {
            health_checker: HealthChecker::new(
                Arc::clone(&slot),
                reconciler.clone(),
                Arc::clone(&listener),
            ),
            reconciler,
            listener,
            slot,
            attempts: AttemptBoard::new(),
        }
    }
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.health_checker.check_health().await;
    let code = match status.status {
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(status))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bridge/callback", post(bridge::direct_callback))
        .route("/bridge/events", post(bridge::post_event))
        .route("/bridge/slot", put(bridge::write_slot))
        .route("/payments/attempts", post(attempts::start_attempt))
        .route(
            "/payments/attempts/current",
            get(attempts::current_attempt).delete(attempts::cancel_attempt),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}
