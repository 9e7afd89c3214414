//! Services module for payment result reconciliation

pub mod event_bus;
pub mod listener;
pub mod reconciler;
pub mod session;

pub use event_bus::{ResultBus, ResultEnvelope, PAYMENT_RESULT_EVENT};
pub use listener::{DirectCallbackSlot, MultiChannelListener};
pub use reconciler::{PaymentReconciler, ReconcileError, ResultCallback};
pub use session::{SessionPhase, SessionSnapshot};

use std::sync::Arc;
use tracing::info;

use crate::cache::slot::{DurableSlot, MemorySlot};
use crate::config::{ReconcilerConfig, SlotBackend, SlotConfig};

/// Open the configured durable slot backend.
pub async fn connect_slot(config: &SlotConfig) -> Result<Arc<dyn DurableSlot>, ReconcileError> {
    match config.backend {
        SlotBackend::Memory => {
            info!("Using in-memory payment slot");
            Ok(Arc::new(MemorySlot::new()))
        }
        #[cfg(feature = "cache")]
        SlotBackend::Redis => {
            let cache_config = crate::cache::CacheConfig {
                redis_url: config.redis_url.clone(),
                ..crate::cache::CacheConfig::default()
            };
            let slot = crate::cache::RedisSlot::connect(cache_config, &config.terminal_id).await?;
            Ok(Arc::new(slot))
        }
        #[cfg(not(feature = "cache"))]
        SlotBackend::Redis => Err(ReconcileError::UnsupportedBackend("redis".to_string())),
    }
}

/// Wire the reconciler and the always-on listener around one bus and slot.
///
/// Must be called inside a tokio runtime; the storage relay starts immediately.
pub fn build_pipeline(
    config: ReconcilerConfig,
    slot: Arc<dyn DurableSlot>,
) -> (PaymentReconciler, Arc<MultiChannelListener>) {
    let bus = ResultBus::new();
    let reconciler = PaymentReconciler::new(config, bus.clone(), Arc::clone(&slot));
    let listener = Arc::new(MultiChannelListener::new(bus, slot));
    listener.start();
    (reconciler, listener)
}
