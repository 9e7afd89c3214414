//! Application configuration module
//! Handles environment variable loading, configuration validation, and application settings

use std::env;
use std::time::Duration;

use crate::workers::slot_poller::SlotPollerConfig;

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub slot: SlotConfig,
    pub reconciler: ReconcilerConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// Where the durable result slot lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotBackend {
    Memory,
    Redis,
}

/// Durable slot configuration
#[derive(Debug, Clone)]
pub struct SlotConfig {
    pub backend: SlotBackend,
    pub redis_url: String,
    /// Identifies the payment terminal this kiosk drives; scopes the slot key.
    pub terminal_id: String,
}

/// Reconciliation policy
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Used when the UI arms without an explicit max wait.
    pub default_max_wait: Duration,
    /// How many delivered result keys are remembered across attempts.
    pub dedupe_history: usize,
    pub poller: SlotPollerConfig,
}

/// Upper bound accepted for a single attempt's max wait.
pub const MAX_WAIT_CEILING: Duration = Duration::from_secs(600);

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            default_max_wait: Duration::from_secs(120),
            dedupe_history: 32,
            poller: SlotPollerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        Ok(AppConfig {
            server: ServerConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
            slot: SlotConfig::from_env()?,
            reconciler: ReconcilerConfig::from_env()?,
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.logging.validate()?;
        self.slot.validate()?;
        self.reconciler.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue(
                "SERVER_PORT cannot be 0".to_string(),
            ));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue(
                "SERVER_HOST cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl SlotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(SlotConfig {
            backend: match env::var("SLOT_BACKEND")
                .unwrap_or_else(|_| "memory".to_string())
                .to_lowercase()
                .as_str()
            {
                "memory" => SlotBackend::Memory,
                "redis" => SlotBackend::Redis,
                _ => return Err(ConfigError::InvalidValue("SLOT_BACKEND".to_string())),
            },
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            terminal_id: env::var("PAYMENT_TERMINAL_ID").unwrap_or_else(|_| "kiosk".to_string()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.terminal_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue("PAYMENT_TERMINAL_ID".to_string()));
        }

        if self.backend == SlotBackend::Redis
            && !self.redis_url.starts_with("redis://")
            && !self.redis_url.starts_with("rediss://")
        {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(())
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ReconcilerConfig {
            default_max_wait: Duration::from_millis(
                env::var("PAYMENT_DEFAULT_MAX_WAIT_MS")
                    .unwrap_or_else(|_| "120000".to_string())
                    .parse()
                    .map_err(|_| {
                        ConfigError::InvalidValue("PAYMENT_DEFAULT_MAX_WAIT_MS".to_string())
                    })?,
            ),
            dedupe_history: env::var("PAYMENT_DEDUPE_HISTORY")
                .unwrap_or_else(|_| "32".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("PAYMENT_DEDUPE_HISTORY".to_string()))?,
            poller: SlotPollerConfig::from_env()?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_wait.is_zero() || self.default_max_wait > MAX_WAIT_CEILING {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_DEFAULT_MAX_WAIT_MS must be between 1 and 600000".to_string(),
            ));
        }

        if self.dedupe_history == 0 {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_DEDUPE_HISTORY must be at least 1".to_string(),
            ));
        }

        if self.poller.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "PAYMENT_POLL_INTERVAL_MS cannot be 0".to_string(),
            ));
        }

        if self.poller.freshness_window < self.poller.poll_interval {
            return Err(ConfigError::ValidationFailed(
                "PAYMENT_FRESHNESS_SECONDS must cover at least one poll interval".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
