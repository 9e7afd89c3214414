//! Durable result slot storage
//!
//! The slot is transient scratch space shared between the payment bridge and
//! the reconciliation core:
//! - an in-memory backend for a single-box kiosk and for tests
//! - a Redis backend (pooled, with pub/sub change notifications) when the
//!   bridge host and the kiosk service run as separate processes

pub mod error;
pub mod keys;
#[cfg(feature = "cache")]
pub mod redis_slot;
pub mod slot;

pub use error::{SlotError, SlotResult};
pub use slot::{DurableSlot, MemorySlot, SlotEntry, SlotNotice};

#[cfg(feature = "cache")]
pub use redis_slot::RedisSlot;

#[cfg(feature = "cache")]
use bb8::Pool;
#[cfg(feature = "cache")]
use bb8_redis::RedisConnectionManager;
use std::time::Duration;
#[cfg(feature = "cache")]
use tracing::{error, info, warn};

/// Redis connection pool type alias
#[cfg(feature = "cache")]
pub type RedisPool = Pool<RedisConnectionManager>;

/// Redis pool configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Redis connection URL
    pub redis_url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum idle connections
    pub min_idle: u32,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Maximum lifetime of a connection
    pub max_lifetime: Duration,
    /// Idle timeout before closing connection
    pub idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 8,
            min_idle: 1,
            connection_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Initialize Redis connection pool with fault tolerance
#[cfg(feature = "cache")]
pub async fn init_cache_pool(config: CacheConfig) -> Result<RedisPool, SlotError> {
    info!(
        "Initializing Redis slot pool: max_connections={}, redis_url={}",
        config.max_connections, config.redis_url
    );

    let manager = RedisConnectionManager::new(config.redis_url.as_str()).map_err(|e| {
        error!("Failed to create Redis connection manager: {}", e);
        SlotError::Unreachable(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!("Failed to build Redis connection pool: {}", e);
            SlotError::Unreachable(e.to_string())
        })?;

    // The bridge may come up after us; a failed PING is not fatal.
    if let Err(e) = test_connection(&pool).await {
        warn!("Initial Redis connection test failed, but continuing: {}", e);
    }

    info!("Redis slot pool initialized successfully");
    Ok(pool)
}

#[cfg(feature = "cache")]
async fn test_connection(pool: &RedisPool) -> Result<(), SlotError> {
    let mut conn = pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection for test: {}", e);
        SlotError::Pool(e)
    })?;

    let _: String = redis::cmd("PING")
        .query_async(&mut *conn)
        .await
        .map_err(|e| {
            error!("Redis PING failed: {}", e);
            SlotError::Redis(e)
        })?;

    Ok(())
}

/// Health check for Redis connection pool
#[cfg(feature = "cache")]
pub async fn health_check(pool: &RedisPool) -> Result<(), SlotError> {
    test_connection(pool).await
}
