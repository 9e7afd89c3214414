use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::cache::error::SlotError;
use crate::cache::slot::{DurableSlot, SlotEntry};
use crate::config::ConfigError;
use crate::payments::types::SourceChannel;
use crate::services::event_bus::{ResultBus, ResultEnvelope, PAYMENT_RESULT_EVENT};

// ---------------------------------------------------------------------------
// Custom error type
// ---------------------------------------------------------------------------

/// Errors produced by a single poll of the durable slot.
///
/// The poll loop only logs these; a flaky slot must not end the attempt.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    /// Reading the slot failed.
    #[error("slot read failed: {0}")]
    Slot(#[from] SlotError),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SlotPollerConfig {
    /// How often the slot is re-read while an attempt is armed.
    pub poll_interval: Duration,
    /// Slot values older than this (by write time) are ignored.
    pub freshness_window: Duration,
}

impl Default for SlotPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            freshness_window: Duration::from_secs(60),
        }
    }
}

impl SlotPollerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval: Duration::from_millis(env_u64(
                "PAYMENT_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            freshness_window: Duration::from_secs(env_u64(
                "PAYMENT_FRESHNESS_SECONDS",
                defaults.freshness_window.as_secs(),
            )?),
        })
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Empty,
    Stale { age_secs: i64 },
    /// Written before the current attempt was armed.
    Predates,
    /// Fresh value published and accepted by the reconciler.
    Delivered,
    /// Fresh value published but rejected (duplicate, disarmed, ...).
    Discarded,
}

/// Fallback channel that re-reads the durable slot for bridges whose storage
/// writes do not raise change notifications in the writing context.
pub struct SlotPoller {
    slot: Arc<dyn DurableSlot>,
    bus: ResultBus,
    config: SlotPollerConfig,
    /// `None` polls until shut down.
    deadline: Option<Instant>,
    not_before: Option<DateTime<Utc>>,
}

impl SlotPoller {
    pub fn new(
        slot: Arc<dyn DurableSlot>,
        bus: ResultBus,
        config: SlotPollerConfig,
        deadline: Option<Instant>,
    ) -> Self {
        Self {
            slot,
            bus,
            config,
            deadline,
            not_before: None,
        }
    }

    /// Ignore slot values written before `started_at`.
    pub fn with_not_before(mut self, started_at: DateTime<Utc>) -> Self {
        self.not_before = Some(started_at);
        self
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        debug!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            freshness_window_secs = self.config.freshness_window.as_secs(),
            backend = self.slot.backend(),
            "payment slot poller started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if is_past_deadline(Instant::now(), self.deadline) {
                        debug!("payment slot poller reached max wait");
                        break;
                    }
                    match self.poll_once().await {
                        Ok(PollOutcome::Delivered) => break,
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "payment slot poll failed"),
                    }
                }
            }
        }

        debug!("payment slot poller stopped");
    }

    pub async fn poll_once(&self) -> Result<PollOutcome, PollError> {
        let entry = match self.slot.read().await? {
            Some(entry) => entry,
            None => return Ok(PollOutcome::Empty),
        };
        if let Some(ignored) = self.screen(&entry) {
            return Ok(ignored);
        }

        // Take before routing so no other channel picks the same value up.
        let entry = match self.slot.take().await {
            Ok(Some(taken)) if taken == entry => taken,
            Ok(Some(newer)) => {
                // overwritten since the read; it is gone from the slot either way
                if let Some(ignored) = self.screen(&newer) {
                    return Ok(ignored);
                }
                newer
            }
            Ok(None) => {
                debug!("payment slot already taken by another channel");
                entry
            }
            Err(e) => {
                warn!(error = %e, "failed to take payment slot value; routing it anyway");
                entry
            }
        };

        let envelope = ResultEnvelope::from_slot(SourceChannel::Poller, entry);
        if self.bus.publish(PAYMENT_RESULT_EVENT, &envelope) {
            Ok(PollOutcome::Delivered)
        } else {
            Ok(PollOutcome::Discarded)
        }
    }

    /// Why `entry` must not be routed, if it must not.
    fn screen(&self, entry: &SlotEntry) -> Option<PollOutcome> {
        let now = Utc::now();
        if entry.is_stale(now, self.config.freshness_window) {
            let age_secs = entry.age(now).num_seconds();
            debug!(age_secs, "ignoring stale payment slot value");
            return Some(PollOutcome::Stale { age_secs });
        }

        if self.not_before.is_some_and(|started| entry.written_at < started) {
            debug!(
                written_at = %entry.written_at,
                "ignoring payment slot value from before this attempt"
            );
            return Some(PollOutcome::Predates);
        }

        None
    }
}

pub(crate) fn is_past_deadline(now: Instant, deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| now >= deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::error::SlotResult;
    use crate::cache::slot::{MemorySlot, SlotNotice};
    use crate::payments::types::RawResult;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::broadcast;

    /// Slot whose value is overwritten between the poller's read and take.
    struct OverwrittenSlot {
        read: SlotEntry,
        taken: SlotEntry,
        notices: broadcast::Sender<SlotNotice>,
    }

    #[async_trait::async_trait]
    impl DurableSlot for OverwrittenSlot {
        async fn read(&self) -> SlotResult<Option<SlotEntry>> {
            Ok(Some(self.read.clone()))
        }

        async fn write(&self, _entry: SlotEntry) -> SlotResult<()> {
            Ok(())
        }

        async fn take(&self) -> SlotResult<Option<SlotEntry>> {
            Ok(Some(self.taken.clone()))
        }

        fn subscribe(&self) -> broadcast::Receiver<SlotNotice> {
            self.notices.subscribe()
        }

        fn backend(&self) -> &'static str {
            "overwritten"
        }
    }

    fn poller(slot: Arc<MemorySlot>, bus: ResultBus) -> SlotPoller {
        SlotPoller::new(
            slot,
            bus,
            SlotPollerConfig::default(),
            Some(Instant::now() + Duration::from_secs(30)),
        )
    }

    fn counting_bus(accept: bool) -> (ResultBus, Arc<AtomicUsize>) {
        let bus = ResultBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        bus.subscribe(PAYMENT_RESULT_EVENT, move |env| {
            assert_eq!(env.channel, SourceChannel::Poller);
            counter.fetch_add(1, Ordering::SeqCst);
            accept
        });
        (bus, hits)
    }

    fn approved() -> RawResult {
        RawResult::from_value(json!({"transactionResult": 0, "nsu": "4455"}))
    }

    #[tokio::test]
    async fn empty_slot_is_not_an_error() {
        let (bus, hits) = counting_bus(true);
        let outcome = poller(Arc::new(MemorySlot::new()), bus)
            .poll_once()
            .await
            .expect("poll");
        assert_eq!(outcome, PollOutcome::Empty);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ninety_second_old_value_is_ignored() {
        let slot = Arc::new(MemorySlot::new());
        slot.write(SlotEntry::written_at(
            approved(),
            Utc::now() - chrono::Duration::seconds(90),
        ))
        .await
        .expect("write");

        let (bus, hits) = counting_bus(true);
        let outcome = poller(Arc::clone(&slot), bus).poll_once().await.expect("poll");

        assert!(matches!(outcome, PollOutcome::Stale { age_secs } if age_secs >= 90));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        // stale values are left alone, not consumed
        assert!(slot.read().await.expect("read").is_some());
    }

    #[tokio::test]
    async fn fresh_value_is_taken_then_routed() {
        let slot = Arc::new(MemorySlot::new());
        slot.write(SlotEntry::new(approved())).await.expect("write");

        let (bus, hits) = counting_bus(true);
        let outcome = poller(Arc::clone(&slot), bus).poll_once().await.expect("poll");

        assert_eq!(outcome, PollOutcome::Delivered);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(slot.read().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn write_landing_between_read_and_take_is_routed() {
        let slot = Arc::new(OverwrittenSlot {
            read: SlotEntry::new(approved()),
            taken: SlotEntry::new(RawResult::from_value(
                json!({"transactionResult": 0, "nsu": "9911"}),
            )),
            notices: broadcast::channel(1).0,
        });
        let bus = ResultBus::new();
        let routed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&routed);
        bus.subscribe(PAYMENT_RESULT_EVENT, move |env| {
            sink.lock().unwrap().push(env.raw.get("nsu").cloned());
            true
        });

        let poller = SlotPoller::new(slot, bus, SlotPollerConfig::default(), None);
        assert_eq!(poller.poll_once().await.expect("poll"), PollOutcome::Delivered);
        assert_eq!(*routed.lock().unwrap(), vec![Some(json!("9911"))]);
    }

    #[tokio::test]
    async fn value_written_before_arm_is_left_alone() {
        let slot = Arc::new(MemorySlot::new());
        let armed_at = Utc::now();
        slot.write(SlotEntry::written_at(
            approved(),
            armed_at - chrono::Duration::seconds(5),
        ))
        .await
        .expect("write");

        let (bus, hits) = counting_bus(true);
        let outcome = poller(Arc::clone(&slot), bus)
            .with_not_before(armed_at)
            .poll_once()
            .await
            .expect("poll");

        assert_eq!(outcome, PollOutcome::Predates);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(slot.read().await.expect("read").is_some());
    }

    #[tokio::test]
    async fn rejected_value_reports_discarded() {
        let slot = Arc::new(MemorySlot::new());
        slot.write(SlotEntry::new(approved())).await.expect("write");

        let (bus, _hits) = counting_bus(false);
        let outcome = poller(slot, bus).poll_once().await.expect("poll");
        assert_eq!(outcome, PollOutcome::Discarded);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_at_deadline() {
        let (bus, hits) = counting_bus(true);
        let (_tx, rx) = watch::channel(false);
        let poller = SlotPoller::new(
            Arc::new(MemorySlot::new()),
            bus,
            SlotPollerConfig::default(),
            Some(Instant::now() + Duration::from_secs(2)),
        );

        tokio::time::timeout(Duration::from_secs(5), poller.run(rx))
            .await
            .expect("poller should stop on its own");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_signal() {
        let (bus, _hits) = counting_bus(true);
        let (tx, rx) = watch::channel(false);
        let poller = SlotPoller::new(
            Arc::new(MemorySlot::new()),
            bus,
            SlotPollerConfig::default(),
            None,
        );

        let handle = tokio::spawn(poller.run(rx));
        tokio::time::sleep(Duration::from_secs(1)).await;
        tx.send(true).expect("poller still listening");

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller should stop")
            .expect("poller task should not panic");
    }

    #[test]
    fn deadline_check_is_inclusive() {
        let now = Instant::now();
        assert!(is_past_deadline(now, Some(now)));
        assert!(!is_past_deadline(now, Some(now + Duration::from_millis(1))));
        assert!(!is_past_deadline(now, None));
    }

    #[test]
    fn unparseable_env_values_are_rejected() {
        assert_eq!(env_u64("PAYMENT_POLLER_TEST_UNSET_VARIABLE", 7).ok(), Some(7));

        std::env::set_var("PAYMENT_POLLER_TEST_BAD_VALUE", "half a second");
        assert!(matches!(
            env_u64("PAYMENT_POLLER_TEST_BAD_VALUE", 500),
            Err(ConfigError::InvalidValue(name)) if name == "PAYMENT_POLLER_TEST_BAD_VALUE"
        ));
        std::env::set_var("PAYMENT_POLLER_TEST_BAD_VALUE", " 250 ");
        assert_eq!(env_u64("PAYMENT_POLLER_TEST_BAD_VALUE", 500).ok(), Some(250));
        std::env::remove_var("PAYMENT_POLLER_TEST_BAD_VALUE");
    }
}
