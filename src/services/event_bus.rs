//! In-process event bus every notification channel adapts into.
//!
//! Dispatch is synchronous: `publish` runs the matching handlers on the
//! caller's stack before returning, the same way a DOM event reaches its
//! listeners. Handlers are cloned out of the registry before they run, so a
//! handler may publish or (un)subscribe re-entrantly.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::time::Instant;

use crate::cache::slot::SlotEntry;
use crate::payments::types::{RawResult, SourceChannel};

/// Event name the bridge and every adapter use for payment outcomes.
pub const PAYMENT_RESULT_EVENT: &str = "payment:result";

/// A raw result plus where and when it arrived.
#[derive(Debug, Clone)]
pub struct ResultEnvelope {
    pub channel: SourceChannel,
    pub raw: RawResult,
    pub received_at: Instant,
    /// Slot write time, for results that came out of the durable slot.
    /// Doubles as the result timestamp when the payload carries none.
    pub written_at: Option<DateTime<Utc>>,
}

impl ResultEnvelope {
    pub fn new(channel: SourceChannel, raw: RawResult) -> Self {
        Self {
            channel,
            raw,
            received_at: Instant::now(),
            written_at: None,
        }
    }

    /// Envelope for a value read out of (or announced by) the durable slot.
    pub fn from_slot(channel: SourceChannel, entry: SlotEntry) -> Self {
        Self {
            written_at: Some(entry.written_at),
            ..Self::new(channel, entry.result)
        }
    }

    pub fn with_received_at(mut self, received_at: Instant) -> Self {
        self.received_at = received_at;
        self
    }
}

/// Returns `true` when the handler accepted the envelope.
pub type BusHandler = Arc<dyn Fn(&ResultEnvelope) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    event: String,
    handler: BusHandler,
}

#[derive(Clone, Default)]
pub struct ResultBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
}

impl ResultBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&ResultEnvelope) -> bool + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.write().push(Subscription {
            id,
            event: event.to_string(),
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Deliver to every handler of `event`. Returns whether any accepted.
    pub fn publish(&self, event: &str, envelope: &ResultEnvelope) -> bool {
        let handlers: Vec<BusHandler> = self
            .read()
            .iter()
            .filter(|s| s.event == event)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        handlers
            .iter()
            .fold(false, |accepted, handler| handler(envelope) || accepted)
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.read().iter().filter(|s| s.event == event).count()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for ResultBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultBus")
            .field("subscriptions", &self.read().len())
            .finish()
    }
}
