//! Adapters that turn each external delivery mechanism into a
//! `payment:result` envelope on the [`ResultBus`].
//!
//! The polling fallback lives in `workers::slot_poller` because it is owned by
//! the armed session; everything here is registered once and stays up.

use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::slot::{DurableSlot, SlotNotice};
use crate::payments::types::{RawResult, SourceChannel};
use crate::services::event_bus::{ResultBus, ResultEnvelope, PAYMENT_RESULT_EVENT};

/// The well-known function reference the bridge may call directly.
///
/// Whoever owns the bridge ingress holds this and republishes through it.
#[derive(Debug, Clone)]
pub struct DirectCallbackSlot {
    bus: ResultBus,
}

impl DirectCallbackSlot {
    pub fn new(bus: ResultBus) -> Self {
        Self { bus }
    }

    pub fn invoke(&self, raw: RawResult) -> bool {
        let envelope = ResultEnvelope::new(SourceChannel::DirectCallback, raw);
        self.bus.publish(PAYMENT_RESULT_EVENT, &envelope)
    }
}

pub struct MultiChannelListener {
    bus: ResultBus,
    slot: Arc<dyn DurableSlot>,
    direct: DirectCallbackSlot,
    storage_task: Mutex<Option<JoinHandle<()>>>,
}

impl MultiChannelListener {
    pub fn new(bus: ResultBus, slot: Arc<dyn DurableSlot>) -> Self {
        Self {
            direct: DirectCallbackSlot::new(bus.clone()),
            bus,
            slot,
            storage_task: Mutex::new(None),
        }
    }

    /// Begin relaying durable-slot change notifications. Calling it again
    /// while the relay is running does nothing.
    pub fn start(&self) {
        let mut task = self
            .storage_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let notices = self.slot.subscribe();
        *task = Some(tokio::spawn(watch_storage(notices, self.bus.clone())));
        info!(backend = self.slot.backend(), "payment result listener started");
    }

    pub fn stop(&self) {
        let task = self
            .storage_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
            info!("payment result listener stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.storage_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn direct_callback(&self) -> &DirectCallbackSlot {
        &self.direct
    }

    /// Post an in-process `payment:result` event.
    pub fn post_event(&self, raw: RawResult) -> bool {
        let envelope = ResultEnvelope::new(SourceChannel::InProcessEvent, raw);
        self.bus.publish(PAYMENT_RESULT_EVENT, &envelope)
    }

    pub fn bus(&self) -> &ResultBus {
        &self.bus
    }

    pub fn slot(&self) -> &Arc<dyn DurableSlot> {
        &self.slot
    }
}

impl Drop for MultiChannelListener {
    fn drop(&mut self) {
        let task = self
            .storage_task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

async fn watch_storage(mut notices: Receiver<SlotNotice>, bus: ResultBus) {
    loop {
        let notice = match notices.recv().await {
            Ok(notice) => notice,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "payment slot notifications lagged; poller will cover");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        // Emptying the slot is the poller's (or the bridge's) housekeeping.
        let Some(entry) = notice.entry else {
            continue;
        };

        // Freshness and before-arm rules are applied by the gate.
        let envelope = ResultEnvelope::from_slot(SourceChannel::StorageChange, entry)
            .with_received_at(notice.observed_at);
        let accepted = bus.publish(PAYMENT_RESULT_EVENT, &envelope);
        debug!(accepted, "payment slot change relayed");
    }

    debug!("payment slot notification stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::slot::{MemorySlot, SlotEntry};
    use serde_json::json;
    use std::time::Duration;

    fn recording_bus() -> (ResultBus, Arc<Mutex<Vec<SourceChannel>>>) {
        let bus = ResultBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(PAYMENT_RESULT_EVENT, move |env| {
            sink.lock().unwrap().push(env.channel);
            true
        });
        (bus, seen)
    }

    #[tokio::test]
    async fn direct_and_event_channels_publish_synchronously() {
        let (bus, seen) = recording_bus();
        let listener = MultiChannelListener::new(bus, Arc::new(MemorySlot::new()));

        assert!(listener.direct_callback().invoke(RawResult::default()));
        assert!(listener.post_event(RawResult::default()));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SourceChannel::DirectCallback, SourceChannel::InProcessEvent]
        );
    }

    #[tokio::test]
    async fn slot_writes_are_relayed_and_takes_ignored() {
        let (bus, seen) = recording_bus();
        let slot = Arc::new(MemorySlot::new());
        let listener = MultiChannelListener::new(bus, slot.clone());
        listener.start();
        listener.start();

        slot.write(SlotEntry::new(RawResult::from_value(json!({"nsu": "9"}))))
            .await
            .expect("write");
        slot.take().await.expect("take");

        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(*seen.lock().unwrap(), vec![SourceChannel::StorageChange]);
        listener.stop();
    }

    #[tokio::test]
    async fn relayed_slot_values_carry_their_write_time() {
        let bus = ResultBus::new();
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stamps);
        bus.subscribe(PAYMENT_RESULT_EVENT, move |env| {
            sink.lock().unwrap().push(env.written_at);
            true
        });
        let slot = Arc::new(MemorySlot::new());
        let listener = MultiChannelListener::new(bus, slot.clone());
        listener.start();

        let written_at = chrono::Utc::now() - chrono::Duration::seconds(90);
        slot.write(SlotEntry::written_at(RawResult::default(), written_at))
            .await
            .expect("write");
        for _ in 0..50 {
            if !stamps.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*stamps.lock().unwrap(), vec![Some(written_at)]);

        listener.post_event(RawResult::default());
        assert_eq!(stamps.lock().unwrap()[1], None);
        listener.stop();
    }

    #[tokio::test]
    async fn stopped_listener_no_longer_relays() {
        let (bus, seen) = recording_bus();
        let slot = Arc::new(MemorySlot::new());
        let listener = MultiChannelListener::new(bus, slot.clone());
        listener.start();
        assert!(listener.is_running());
        listener.stop();
        assert!(!listener.is_running());
        tokio::task::yield_now().await;

        slot.write(SlotEntry::new(RawResult::default())).await.expect("write");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
