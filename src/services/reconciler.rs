//! Payment result reconciliation: the session lifecycle controller and the
//! idempotency gate every notification channel funnels into.
//!
//! A `PaymentReconciler` listens on the [`ResultBus`] for `payment:result`
//! envelopes. Between `arm()` and the first accepted result (or `disarm()`,
//! or the soft timeout) exactly one envelope may reach the consumer callback.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::error::SlotError;
use crate::cache::slot::{written_outside_window, DurableSlot};
use crate::config::ReconcilerConfig;
use crate::payments::normalizer::{normalize, normalize_at};
use crate::payments::types::{CanonicalResult, RawResult, ResultKey, SourceChannel};
use crate::services::event_bus::{ResultBus, ResultEnvelope, SubscriptionId, PAYMENT_RESULT_EVENT};
use crate::services::session::{SessionPhase, SessionSnapshot, SessionState, SessionTimers};
use crate::workers::slot_poller::SlotPoller;

/// Consumer callback, invoked at most once per arm cycle.
pub type ResultCallback = Box<dyn FnOnce(CanonicalResult) + Send + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("durable slot unavailable: {0}")]
    Slot(#[from] SlotError),

    #[error("slot backend '{0}' is not available in this build")]
    UnsupportedBackend(String),
}

struct ControllerState {
    session: SessionState,
    on_result: Option<ResultCallback>,
    timers: Option<SessionTimers>,
    /// Keys of results already handed to a consumer, oldest first.
    delivered: VecDeque<ResultKey>,
}

impl ControllerState {
    fn already_delivered(&self, key: &ResultKey) -> bool {
        self.session.last_accepted_key.as_ref() == Some(key) || self.delivered.contains(key)
    }

    fn remember(&mut self, key: ResultKey, capacity: usize) {
        while self.delivered.len() >= capacity.max(1) {
            self.delivered.pop_front();
        }
        self.delivered.push_back(key);
    }
}

struct Shared {
    config: ReconcilerConfig,
    bus: ResultBus,
    slot: Arc<dyn DurableSlot>,
    subscription: SubscriptionId,
    state: Mutex<ControllerState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The gate. Everything up to recording the key happens under one lock
    /// acquisition; the callback runs after the lock is released.
    fn accept_envelope(&self, envelope: &ResultEnvelope) -> bool {
        let (callback, result, attempt_id, generation, timers) = {
            let mut state = self.lock();
            let session = &state.session;

            if let Some(reason) = self.rejection(session, envelope) {
                debug!(
                    channel = %envelope.channel,
                    phase = ?session.phase,
                    reason,
                    "discarding payment result"
                );
                return false;
            }

            let result = match envelope.written_at {
                Some(fallback) => normalize_at(&envelope.raw, fallback),
                None => normalize(&envelope.raw),
            };
            let key = result.key();

            if state.already_delivered(&key) {
                debug!(
                    channel = %envelope.channel,
                    key = %key,
                    "discarding duplicate payment result"
                );
                return false;
            }

            state.session.mark_processed(key.clone());
            state.remember(key, self.config.dedupe_history);
            (
                state.on_result.take(),
                result,
                state.session.attempt_id,
                state.session.generation,
                state.timers.take(),
            )
        };

        if let Some(timers) = timers {
            timers.cancel();
        }

        info!(
            attempt_id = ?attempt_id,
            channel = %envelope.channel,
            status = %result.status,
            nsu = ?result.nsu,
            "payment result accepted"
        );

        if let Some(callback) = callback {
            callback(result);
        }

        // The callback may have disarmed or re-armed; only close our own attempt.
        let mut state = self.lock();
        let ours = state.session.generation == generation;
        if ours && state.session.phase == SessionPhase::Processed {
            state.session.end();
        }
        true
    }

    /// Gates that need no normalization, in order.
    fn rejection(&self, session: &SessionState, envelope: &ResultEnvelope) -> Option<&'static str> {
        if !session.armed() {
            return Some("no armed attempt");
        }
        if session.received_before_start(envelope.received_at) {
            return Some("received before the attempt was armed");
        }
        if session.is_expired(Instant::now()) {
            return Some("attempt past max wait");
        }
        if let Some(written_at) = envelope.written_at {
            let window = self.config.poller.freshness_window;
            if written_outside_window(written_at, Utc::now(), window) {
                return Some("stale slot value");
            }
            if session.written_before_start(written_at) {
                return Some("slot value written before the attempt was armed");
            }
        }
        if session.processed {
            return Some("attempt already processed");
        }
        None
    }

    fn start_timers(
        self: &Arc<Self>,
        generation: u64,
        armed_at: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Option<SessionTimers> {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("no tokio runtime; slot poller and soft timeout not started");
                return None;
            }
        };

        let (mut timers, shutdown_rx) = SessionTimers::new();

        let poller = SlotPoller::new(
            Arc::clone(&self.slot),
            self.bus.clone(),
            self.config.poller.clone(),
            deadline,
        )
        .with_not_before(armed_at);
        timers.track(handle.spawn(poller.run(shutdown_rx.clone())));

        let weak: Weak<Shared> = Arc::downgrade(self);
        let mut shutdown_rx = shutdown_rx;
        timers.track(handle.spawn(async move {
            let max_wait_elapsed = async move {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = max_wait_elapsed => {
                    if let Some(shared) = weak.upgrade() {
                        shared.expire(generation);
                    }
                }
                _ = shutdown_rx.changed() => {}
            }
        }));

        Some(timers)
    }

    fn expire(&self, generation: u64) {
        let (timers, callback, attempt_id) = {
            let mut state = self.lock();
            if state.session.generation != generation || !state.session.armed() {
                return;
            }
            state.session.end();
            (state.timers.take(), state.on_result.take(), state.session.attempt_id)
        };

        info!(attempt_id = ?attempt_id, "payment attempt reached max wait without a result");
        drop(callback);
        if let Some(timers) = timers {
            timers.cancel();
        }
    }

    fn disarm_where(&self, matches: impl FnOnce(&SessionState) -> bool) -> bool {
        let (timers, callback, attempt_id) = {
            let mut state = self.lock();
            if !matches(&state.session) {
                return false;
            }
            state.session.end();
            (state.timers.take(), state.on_result.take(), state.session.attempt_id)
        };

        drop(callback);
        if let Some(timers) = timers {
            timers.cancel();
        }
        debug!(attempt_id = ?attempt_id, "payment attempt disarmed");
        true
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.subscription);
        let state = self.state.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(timers) = state.timers.take() {
            timers.cancel();
        }
    }
}

/// Handle to the reconciliation core. Cheap to clone.
#[derive(Clone)]
pub struct PaymentReconciler {
    shared: Arc<Shared>,
}

impl PaymentReconciler {
    pub fn new(config: ReconcilerConfig, bus: ResultBus, slot: Arc<dyn DurableSlot>) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let handler = weak.clone();
            let subscription = bus.subscribe(PAYMENT_RESULT_EVENT, move |envelope| {
                handler
                    .upgrade()
                    .is_some_and(|shared| shared.accept_envelope(envelope))
            });

            Shared {
                config,
                bus: bus.clone(),
                slot,
                subscription,
                state: Mutex::new(ControllerState {
                    session: SessionState::disabled(),
                    on_result: None,
                    timers: None,
                    delivered: VecDeque::new(),
                }),
            }
        });

        Self { shared }
    }

    /// Start a new attempt. Any previous attempt is replaced and its callback
    /// dropped without being called.
    pub fn arm<F>(&self, on_result: F, max_wait: Duration) -> Uuid
    where
        F: FnOnce(CanonicalResult) + Send + 'static,
    {
        let now = Instant::now();
        let armed_at = Utc::now();
        let (attempt_id, generation, previous_timers, previous_callback) = {
            let mut state = self.shared.lock();
            let previous_timers = state.timers.take();
            let previous_callback = state.on_result.replace(Box::new(on_result));
            let (attempt_id, generation) = state.session.begin(max_wait, now, armed_at);
            (attempt_id, generation, previous_timers, previous_callback)
        };

        if previous_callback.is_some() {
            debug!("replacing an attempt that never produced a result");
        }
        drop(previous_callback);
        if let Some(timers) = previous_timers {
            timers.cancel();
        }

        // No deadline when `max_wait` is too large to add to the clock.
        let deadline = now.checked_add(max_wait);
        if let Some(timers) = self.shared.start_timers(generation, armed_at, deadline) {
            let mut state = self.shared.lock();
            if state.session.generation == generation && state.session.armed() {
                state.timers = Some(timers);
            } else {
                drop(state);
                timers.cancel();
            }
        }

        info!(
            attempt_id = %attempt_id,
            max_wait_ms = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX),
            "payment attempt armed"
        );
        attempt_id
    }

    /// Stop listening. Safe to call at any time, including from the callback.
    pub fn disarm(&self) {
        self.shared.disarm_where(|_| true);
    }

    /// Disarm only if `attempt_id` is still the current attempt.
    pub fn disarm_attempt(&self, attempt_id: Uuid) -> bool {
        self.shared
            .disarm_where(|session| session.attempt_id == Some(attempt_id) && session.armed())
    }

    /// Run `raw` through the gate as if it had just arrived on `channel`.
    pub fn accept(&self, raw: &RawResult, channel: SourceChannel) -> bool {
        self.shared
            .accept_envelope(&ResultEnvelope::new(channel, raw.clone()))
    }

    /// Arm, wait up to `max_wait` for the outcome, and disarm on silence.
    pub async fn reconcile(&self, max_wait: Duration) -> Option<CanonicalResult> {
        let (tx, rx) = oneshot::channel();
        let attempt_id = self.arm(
            move |result| {
                let _ = tx.send(result);
            },
            max_wait,
        );

        match tokio::time::timeout(max_wait, rx).await {
            Ok(Ok(result)) => Some(result),
            // replaced by a newer attempt or disarmed elsewhere
            Ok(Err(_)) => None,
            Err(_) => {
                self.disarm_attempt(attempt_id);
                None
            }
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.lock().session.phase
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.lock().session.snapshot()
    }

    pub fn default_max_wait(&self) -> Duration {
        self.shared.config.default_max_wait
    }

    pub fn bus(&self) -> &ResultBus {
        &self.shared.bus
    }
}

impl std::fmt::Debug for PaymentReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaymentReconciler")
            .field("session", &self.snapshot())
            .field("slot", &self.shared.slot.backend())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::slot::{MemorySlot, SlotEntry};
    use crate::payments::types::PaymentStatus;
    use serde_json::json;

    fn reconciler() -> PaymentReconciler {
        PaymentReconciler::new(
            ReconcilerConfig::default(),
            ResultBus::new(),
            Arc::new(MemorySlot::new()),
        )
    }

    fn raw(value: serde_json::Value) -> RawResult {
        RawResult::from_value(value)
    }

    type Seen = Arc<Mutex<Vec<CanonicalResult>>>;

    fn collector() -> (Seen, impl FnOnce(CanonicalResult) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |result| sink.lock().unwrap().push(result))
    }

    #[tokio::test]
    async fn disabled_controller_discards_everything() {
        let reconciler = reconciler();
        assert_eq!(reconciler.phase(), SessionPhase::Disabled);
        let approved = raw(json!({"transactionResult": 0}));
        assert!(!reconciler.accept(&approved, SourceChannel::DirectCallback));
    }

    #[tokio::test]
    async fn first_result_wins_then_session_closes() {
        let reconciler = reconciler();
        let (seen, callback) = collector();
        reconciler.arm(callback, Duration::from_secs(30));
        assert_eq!(reconciler.phase(), SessionPhase::Armed);

        let payload = raw(json!({
            "transactionResult": 0,
            "nsu": "777",
            "timestamp": "2026-05-01T10:00:00Z"
        }));
        assert!(reconciler.accept(&payload, SourceChannel::DirectCallback));
        assert!(!reconciler.accept(&payload, SourceChannel::InProcessEvent));
        assert!(!reconciler.accept(
            &raw(json!({"transactionResult": 5, "nsu": "778"})),
            SourceChannel::Poller
        ));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, PaymentStatus::Approved);
        assert_eq!(reconciler.phase(), SessionPhase::Disabled);
    }

    #[tokio::test]
    async fn same_key_is_rejected_in_the_next_session() {
        let reconciler = reconciler();
        let payload = raw(json!({
            "transactionResult": 0,
            "nsu": "42",
            "timestamp": 1_767_225_600_000i64
        }));

        let (first, callback) = collector();
        reconciler.arm(callback, Duration::from_secs(30));
        assert!(reconciler.accept(&payload, SourceChannel::InProcessEvent));

        let (second, callback) = collector();
        reconciler.arm(callback, Duration::from_secs(30));
        assert!(!reconciler.accept(&payload, SourceChannel::StorageChange));

        let fresh = raw(json!({
            "transactionResult": 0,
            "nsu": "43",
            "timestamp": 1_767_225_660_000i64
        }));
        assert!(reconciler.accept(&fresh, SourceChannel::StorageChange));

        assert_eq!(first.lock().unwrap().len(), 1);
        assert_eq!(second.lock().unwrap()[0].nsu.as_deref(), Some("43"));
    }

    #[tokio::test]
    async fn disarm_from_inside_callback_is_safe() {
        let reconciler = reconciler();
        let inner = reconciler.clone();
        reconciler.arm(move |_| inner.disarm(), Duration::from_secs(30));

        let cancelled = raw(json!({"transactionResult": -1}));
        assert!(reconciler.accept(&cancelled, SourceChannel::DirectCallback));
        assert_eq!(reconciler.phase(), SessionPhase::Disabled);
    }

    #[tokio::test]
    async fn rearming_drops_the_previous_callback() {
        let reconciler = reconciler();
        let (stale, callback) = collector();
        let first = reconciler.arm(callback, Duration::from_secs(30));
        let (current, callback) = collector();
        let second = reconciler.arm(callback, Duration::from_secs(30));
        assert_ne!(first, second);
        assert!(!reconciler.disarm_attempt(first));

        let denied = raw(json!({"transactionResult": 12}));
        assert!(reconciler.accept(&denied, SourceChannel::InProcessEvent));
        assert!(stale.lock().unwrap().is_empty());
        assert_eq!(current.lock().unwrap()[0].status, PaymentStatus::Denied);
    }

    #[tokio::test]
    async fn bus_events_reach_the_gate() {
        let reconciler = reconciler();
        let (seen, callback) = collector();
        reconciler.arm(callback, Duration::from_secs(30));

        let envelope =
            ResultEnvelope::new(SourceChannel::InProcessEvent, raw(json!({"nsu": "123456"})));
        assert!(reconciler.bus().publish(PAYMENT_RESULT_EVENT, &envelope));
        assert_eq!(seen.lock().unwrap()[0].status, PaymentStatus::Approved);
    }

    #[tokio::test]
    async fn dropping_the_reconciler_unsubscribes() {
        let bus = ResultBus::new();
        let reconciler = PaymentReconciler::new(
            ReconcilerConfig::default(),
            bus.clone(),
            Arc::new(MemorySlot::new()),
        );
        assert_eq!(bus.subscriber_count(PAYMENT_RESULT_EVENT), 1);
        drop(reconciler);
        assert_eq!(bus.subscriber_count(PAYMENT_RESULT_EVENT), 0);
    }

    #[test]
    fn arming_without_a_runtime_still_gates() {
        let reconciler = reconciler();
        let (seen, callback) = collector();
        reconciler.arm(callback, Duration::from_secs(30));

        let approved = raw(json!({"transactionResult": 0}));
        assert!(reconciler.accept(&approved, SourceChannel::DirectCallback));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn max_wait_beyond_the_clock_arms_without_deadline() {
        let reconciler = reconciler();
        let (seen, callback) = collector();
        reconciler.arm(callback, Duration::from_secs(u64::MAX));
        assert_eq!(reconciler.phase(), SessionPhase::Armed);
        assert_eq!(reconciler.snapshot().max_wait_ms, u64::MAX);

        reconciler.arm(|_| {}, Duration::MAX);
        assert!(reconciler.accept(&raw(json!({"transactionResult": 0})), SourceChannel::Poller));
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(reconciler.phase(), SessionPhase::Disabled);
    }

    #[tokio::test]
    async fn stale_or_pre_arm_slot_values_are_rejected_by_the_gate() {
        let reconciler = reconciler();
        let (seen, callback) = collector();
        let before_arm = Utc::now() - chrono::Duration::milliseconds(50);
        reconciler.arm(callback, Duration::from_secs(30));

        let slot_envelope = |written_at: DateTime<Utc>| {
            ResultEnvelope::from_slot(
                SourceChannel::StorageChange,
                SlotEntry::written_at(raw(json!({"transactionResult": 0})), written_at),
            )
        };
        let bus = reconciler.bus();
        let stale = slot_envelope(Utc::now() - chrono::Duration::seconds(90));
        assert!(!bus.publish(PAYMENT_RESULT_EVENT, &stale));
        assert!(!bus.publish(PAYMENT_RESULT_EVENT, &slot_envelope(before_arm)));
        assert_eq!(reconciler.phase(), SessionPhase::Armed);

        assert!(bus.publish(PAYMENT_RESULT_EVENT, &slot_envelope(Utc::now())));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn delivered_history_is_bounded() {
        let mut state = ControllerState {
            session: SessionState::disabled(),
            on_result: None,
            timers: None,
            delivered: VecDeque::new(),
        };
        for nsu in 0..5 {
            state.remember(
                ResultKey {
                    status: PaymentStatus::Approved,
                    nsu: Some(nsu.to_string()),
                    timestamp: Utc::now(),
                },
                3,
            );
        }
        assert_eq!(state.delivered.len(), 3);
        assert_eq!(state.delivered[0].nsu.as_deref(), Some("2"));
    }
}
