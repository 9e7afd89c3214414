//! Health check module
//! Provides health status for the payment pipeline and its slot backend

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::cache::slot::DurableSlot;
use crate::services::listener::MultiChannelListener;
use crate::services::reconciler::PaymentReconciler;

/// Slot round trips slower than this are reported as a warning.
const SLOW_SLOT_MS: u128 = 1_000;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }

    fn settle(&mut self) {
        let states: Vec<&ComponentState> = self.checks.values().map(|c| &c.status).collect();
        self.status = if states.contains(&&ComponentState::Down) {
            HealthState::Unhealthy
        } else if states.contains(&&ComponentState::Warning) {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }

    fn or_details(mut self, details: impl Into<String>) -> Self {
        if self.details.is_none() {
            self.details = Some(details.into());
        }
        self
    }
}

/// Health checker for the payment pipeline
#[derive(Clone)]
pub struct HealthChecker {
    slot: Arc<dyn DurableSlot>,
    reconciler: PaymentReconciler,
    listener: Arc<MultiChannelListener>,
}

impl HealthChecker {
    pub fn new(
        slot: Arc<dyn DurableSlot>,
        reconciler: PaymentReconciler,
        listener: Arc<MultiChannelListener>,
    ) -> Self {
        Self {
            slot,
            reconciler,
            listener,
        }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();

        // Check slot backend health
        let slot_check = check_slot_health(self.slot.as_ref());
        let slot_health = match timeout(Duration::from_secs(5), slot_check).await {
            Ok(Ok(response_time)) if response_time > SLOW_SLOT_MS => {
                warn!("Payment slot health check slow ({}ms)", response_time);
                ComponentHealth::warning(Some(response_time), Some("Slow response".to_string()))
            }
            Ok(Ok(response_time)) => {
                info!("Payment slot health check: OK ({}ms)", response_time);
                ComponentHealth::up(Some(response_time))
            }
            Ok(Err(e)) => {
                error!("Payment slot health check failed: {}", e);
                ComponentHealth::down(Some(e.to_string()))
            }
            Err(_) => {
                error!("Payment slot health check timed out");
                ComponentHealth::down(Some("Timeout".to_string()))
            }
        };
        health_status.checks.insert(
            "durable_slot".to_string(),
            slot_health.or_details(self.slot.backend()),
        );

        // Storage change relay; the poller still covers while it is down
        let listener_health = if self.listener.is_running() {
            ComponentHealth::up(None)
        } else {
            ComponentHealth::warning(None, Some("Slot change relay not running".to_string()))
        };
        health_status
            .checks
            .insert("listener".to_string(), listener_health);

        let snapshot = self.reconciler.snapshot();
        health_status.checks.insert(
            "reconciler".to_string(),
            ComponentHealth::up(None).or_details(format!("{:?}", snapshot.phase).to_lowercase()),
        );

        health_status.settle();
        health_status
    }
}

pub async fn check_slot_health(
    slot: &dyn DurableSlot,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    slot.health_check().await?;
    Ok(start.elapsed().as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::slot::MemorySlot;
    use crate::config::ReconcilerConfig;
    use crate::services::build_pipeline;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health =
            ComponentHealth::warning(Some(1500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.response_time_ms, Some(1500));
    }

    #[test]
    fn test_overall_state_follows_worst_component() {
        let mut status = HealthStatus::new();
        status.checks.insert("a".to_string(), ComponentHealth::up(None));
        status
            .checks
            .insert("b".to_string(), ComponentHealth::warning(None, None));
        status.settle();
        assert_eq!(status.status, HealthState::Degraded);

        status
            .checks
            .insert("c".to_string(), ComponentHealth::down(None));
        status.settle();
        assert_eq!(status.status, HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_memory_pipeline_is_healthy() {
        let slot: Arc<dyn DurableSlot> = Arc::new(MemorySlot::new());
        let (reconciler, listener) = build_pipeline(ReconcilerConfig::default(), Arc::clone(&slot));
        let checker = HealthChecker::new(slot, reconciler, listener);

        let status = checker.check_health().await;
        assert!(status.is_healthy());
        assert_eq!(
            status.checks["reconciler"].details.as_deref(),
            Some("disabled")
        );
        assert_eq!(
            status.checks["durable_slot"].details.as_deref(),
            Some("memory")
        );
    }
}
