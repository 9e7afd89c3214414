//! Redis-backed durable slot.
//!
//! The slot value lives under a versioned key; every write or take is also
//! published on a change channel so listeners in other processes (the bridge
//! host, a second kiosk screen) see it without polling.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::error::{SlotError, SlotResult};
use crate::cache::keys::payment_result::{ChangeChannelKey, SlotKey};
use crate::cache::slot::{DurableSlot, SlotEntry, SlotNotice, NOTICE_CAPACITY};
use crate::cache::{health_check, init_cache_pool, CacheConfig, RedisPool};

/// Published on the change channel when the slot is emptied.
const CLEARED_PAYLOAD: &str = "";

pub struct RedisSlot {
    pool: RedisPool,
    slot_key: SlotKey,
    channel: ChangeChannelKey,
    notices: broadcast::Sender<SlotNotice>,
    relay: JoinHandle<()>,
}

impl RedisSlot {
    pub async fn connect(config: CacheConfig, terminal_id: &str) -> SlotResult<Self> {
        let slot_key = SlotKey::new(terminal_id);
        let channel = ChangeChannelKey::new(terminal_id);

        let client = redis::Client::open(config.redis_url.clone()).map_err(|e| {
            error!("Failed to create Redis client for slot notifications: {}", e);
            SlotError::Unreachable(e.to_string())
        })?;
        let pool = init_cache_pool(config).await?;

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel.to_string()).await?;

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let relay = tokio::spawn(relay_notifications(pubsub, notices.clone()));

        info!(slot_key = %slot_key, channel = %channel, "Redis payment slot ready");

        Ok(Self {
            pool,
            slot_key,
            channel,
            notices,
            relay,
        })
    }

    async fn publish(&self, payload: &str) -> SlotResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(self.channel.to_string())
            .arg(payload)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }
}

impl Drop for RedisSlot {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

#[async_trait]
impl DurableSlot for RedisSlot {
    async fn read(&self) -> SlotResult<Option<SlotEntry>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.slot_key.to_string())
            .query_async(&mut *conn)
            .await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn write(&self, entry: SlotEntry) -> SlotResult<()> {
        let payload = serde_json::to_string(&entry)?;
        {
            let mut conn = self.pool.get().await?;
            let _: () = redis::cmd("SET")
                .arg(self.slot_key.to_string())
                .arg(&payload)
                .query_async(&mut *conn)
                .await?;
        }
        self.publish(&payload).await
    }

    async fn take(&self) -> SlotResult<Option<SlotEntry>> {
        // read and delete in one round trip
        let raw: Option<String> = {
            let mut conn = self.pool.get().await?;
            redis::cmd("GETDEL")
                .arg(self.slot_key.to_string())
                .query_async(&mut *conn)
                .await?
        };
        let Some(json) = raw else {
            return Ok(None);
        };
        self.publish(CLEARED_PAYLOAD).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn subscribe(&self) -> broadcast::Receiver<SlotNotice> {
        self.notices.subscribe()
    }

    async fn health_check(&self) -> SlotResult<()> {
        health_check(&self.pool).await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}

async fn relay_notifications(
    mut pubsub: redis::aio::PubSub,
    notices: broadcast::Sender<SlotNotice>,
) {
    let mut messages = pubsub.on_message();
    while let Some(message) = messages.next().await {
        let observed_at = Instant::now();
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Unreadable slot change notification");
                continue;
            }
        };

        let entry = if payload == CLEARED_PAYLOAD {
            None
        } else {
            match serde_json::from_str::<SlotEntry>(&payload) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(error = %e, "Malformed slot change notification");
                    continue;
                }
            }
        };

        if notices.send(SlotNotice { entry, observed_at }).is_err() {
            debug!("Slot change notification had no subscribers");
        }
    }
    warn!("Redis slot notification stream ended");
}
