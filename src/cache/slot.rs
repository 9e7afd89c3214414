//! Shared durable slot the bridge parks results in.
//!
//! The bridge writes the slot and the poller takes from it, so callers must
//! treat "value present" and "already taken" as equally normal outcomes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::cache::error::SlotResult;
use crate::payments::types::RawResult;

/// Buffered change notifications per subscriber.
pub const NOTICE_CAPACITY: usize = 64;

/// A result as stored in the slot, stamped with its write time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotEntry {
    pub result: RawResult,
    pub written_at: DateTime<Utc>,
}

impl SlotEntry {
    pub fn new(result: RawResult) -> Self {
        Self::written_at(result, Utc::now())
    }

    pub fn written_at(result: RawResult, written_at: DateTime<Utc>) -> Self {
        Self { result, written_at }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.written_at)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, freshness_window: Duration) -> bool {
        written_outside_window(self.written_at, now, freshness_window)
    }
}

/// True when a value written at `written_at` is older than `freshness_window`.
/// Write times in the future (clock skew) count as fresh.
pub fn written_outside_window(
    written_at: DateTime<Utc>,
    now: DateTime<Utc>,
    freshness_window: Duration,
) -> bool {
    match now.signed_duration_since(written_at).to_std() {
        Ok(age) => age > freshness_window,
        Err(_) => false,
    }
}

/// Change notification fired on every write or take.
#[derive(Debug, Clone)]
pub struct SlotNotice {
    /// `None` when the slot was emptied.
    pub entry: Option<SlotEntry>,
    /// When this process observed the change.
    pub observed_at: Instant,
}

#[async_trait]
pub trait DurableSlot: Send + Sync {
    async fn read(&self) -> SlotResult<Option<SlotEntry>>;

    async fn write(&self, entry: SlotEntry) -> SlotResult<()>;

    /// Atomically remove and return the current value.
    async fn take(&self) -> SlotResult<Option<SlotEntry>>;

    fn subscribe(&self) -> broadcast::Receiver<SlotNotice>;

    async fn health_check(&self) -> SlotResult<()> {
        Ok(())
    }

    fn backend(&self) -> &'static str;
}

/// In-process slot for a single-box kiosk and for tests.
pub struct MemorySlot {
    value: Mutex<Option<SlotEntry>>,
    notices: broadcast::Sender<SlotNotice>,
}

impl MemorySlot {
    pub fn new() -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            value: Mutex::new(None),
            notices,
        }
    }

    fn value(&self) -> MutexGuard<'_, Option<SlotEntry>> {
        self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, entry: Option<SlotEntry>) {
        // no subscribers is fine
        let _ = self.notices.send(SlotNotice {
            entry,
            observed_at: Instant::now(),
        });
    }
}

impl Default for MemorySlot {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableSlot for MemorySlot {
    async fn read(&self) -> SlotResult<Option<SlotEntry>> {
        Ok(self.value().clone())
    }

    async fn write(&self, entry: SlotEntry) -> SlotResult<()> {
        *self.value() = Some(entry.clone());
        self.notify(Some(entry));
        Ok(())
    }

    async fn take(&self) -> SlotResult<Option<SlotEntry>> {
        let taken = self.value().take();
        if taken.is_some() {
            self.notify(None);
        }
        Ok(taken)
    }

    fn subscribe(&self) -> broadcast::Receiver<SlotNotice> {
        self.notices.subscribe()
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> SlotEntry {
        SlotEntry::new(RawResult::from_value(json!({"transactionResult": 0, "nsu": "1"})))
    }

    #[test]
    fn staleness_uses_write_time() {
        let now = Utc::now();
        let at = |offset: i64| {
            SlotEntry::written_at(RawResult::default(), now + chrono::Duration::seconds(offset))
        };
        let (old, recent, future) = (at(-90), at(-5), at(5));

        assert!(old.is_stale(now, Duration::from_secs(60)));
        assert!(!recent.is_stale(now, Duration::from_secs(60)));
        assert!(!future.is_stale(now, Duration::from_secs(60)));
    }

    #[test]
    fn slot_entry_json_shape() {
        let value = serde_json::to_value(entry()).expect("serialization should succeed");
        assert_eq!(value["result"]["nsu"], "1");
        assert!(value["writtenAt"].is_string());

        let back: SlotEntry =
            serde_json::from_value(value).expect("deserialization should succeed");
        assert_eq!(back.result.get("nsu"), Some(&json!("1")));
    }

    #[tokio::test]
    async fn memory_slot_write_read_take() {
        let slot = MemorySlot::new();
        assert!(slot.read().await.expect("read").is_none());

        let written = entry();
        slot.write(written.clone()).await.expect("write");
        assert!(slot.read().await.expect("read").is_some());

        assert_eq!(slot.take().await.expect("take"), Some(written));
        assert!(slot.take().await.expect("second take").is_none());
        assert!(slot.read().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn take_returns_the_latest_write() {
        let slot = MemorySlot::new();
        slot.write(entry()).await.expect("write");
        let newer = SlotEntry::new(RawResult::from_value(json!({"nsu": "2"})));
        slot.write(newer.clone()).await.expect("overwrite");

        assert_eq!(slot.take().await.expect("take"), Some(newer));
    }

    #[tokio::test]
    async fn memory_slot_notifies_subscribers() {
        let slot = MemorySlot::new();
        let mut rx = slot.subscribe();

        slot.write(entry()).await.expect("write");
        slot.take().await.expect("take");

        let written = rx.recv().await.expect("write notice");
        assert!(written.entry.is_some());
        let emptied = rx.recv().await.expect("take notice");
        assert!(emptied.entry.is_none());
    }
}
