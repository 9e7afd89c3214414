//! Error handling for the kiosk payment service
//!
//! The reconciliation core never fails towards its consumer; these errors only
//! cover the HTTP surface and the infrastructure behind it.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cache::error::SlotError;
use crate::config::ConfigError;
use crate::payments::error::PaymentError;

/// Error codes for programmatic handling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    // Domain errors (4xx)
    #[serde(rename = "NO_ACTIVE_ATTEMPT")]
    NoActiveAttempt,

    // Infrastructure errors (5xx)
    #[serde(rename = "SLOT_ERROR")]
    SlotError,
    #[serde(rename = "CONFIGURATION_ERROR")]
    ConfigurationError,

    // Generic
    #[serde(rename = "INTERNAL_ERROR")]
    InternalError,
    #[serde(rename = "VALIDATION_ERROR")]
    ValidationError,
}

/// Business rule violations on the attempt lifecycle
#[derive(Debug, Clone)]
pub enum DomainError {
    /// Nothing is armed and no outcome is on record
    NoActiveAttempt,
}

/// Infrastructure-level errors (slot backend, configuration)
#[derive(Debug, Clone)]
pub enum InfrastructureError {
    /// Durable slot unavailable or returned garbage
    Slot { message: String },
    /// Missing or invalid configuration
    Configuration { message: String },
}

/// Input validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    /// A value outside the accepted set, e.g. a bridge event other than
    /// `payment:result`
    Unsupported { field: String, value: String },
    /// Field value out of acceptable range
    OutOfRange {
        field: String,
        min: Option<String>,
        max: Option<String>,
    },
}

/// Unified application error type
#[derive(Debug, Clone)]
pub struct AppError {
    pub kind: AppErrorKind,
    pub request_id: Option<String>,
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub enum AppErrorKind {
    Domain(DomainError),
    Infrastructure(InfrastructureError),
    Validation(ValidationError),
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        Self {
            kind,
            request_id: None,
            context: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Map error to HTTP status code
    pub fn status_code(&self) -> u16 {
        match &self.kind {
            AppErrorKind::Domain(DomainError::NoActiveAttempt) => 404,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Slot { .. } => 503,
                InfrastructureError::Configuration { .. } => 500,
            },
            AppErrorKind::Validation(_) => 400,
        }
    }

    /// Get error code for client handling
    pub fn error_code(&self) -> ErrorCode {
        match &self.kind {
            AppErrorKind::Domain(DomainError::NoActiveAttempt) => ErrorCode::NoActiveAttempt,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Slot { .. } => ErrorCode::SlotError,
                InfrastructureError::Configuration { .. } => ErrorCode::ConfigurationError,
            },
            AppErrorKind::Validation(_) => ErrorCode::ValidationError,
        }
    }

    /// Get user-friendly error message
    pub fn user_message(&self) -> String {
        match &self.kind {
            AppErrorKind::Domain(DomainError::NoActiveAttempt) => {
                "No payment attempt is in progress".to_string()
            }
            AppErrorKind::Infrastructure(_) => {
                "Payment terminal storage temporarily unavailable. Please try again later"
                    .to_string()
            }
            AppErrorKind::Validation(err) => match err {
                ValidationError::Unsupported { field, value } => {
                    format!("Unsupported {} '{}'", field, value)
                }
                ValidationError::OutOfRange { field, min, max } => match (min, max) {
                    (Some(min), Some(max)) => {
                        format!("Field '{}' must be between {} and {}", field, min, max)
                    }
                    (Some(min), None) => {
                        format!("Field '{}' must be at least {}", field, min)
                    }
                    (None, Some(max)) => {
                        format!("Field '{}' must be at most {}", field, max)
                    }
                    (None, None) => {
                        format!("Field '{}' is out of acceptable range", field)
                    }
                },
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            AppErrorKind::Domain(_) => false,
            AppErrorKind::Infrastructure(err) => match err {
                InfrastructureError::Slot { .. } => true,
                InfrastructureError::Configuration { .. } => false,
            },
            AppErrorKind::Validation(_) => false,
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message())
    }
}

impl std::error::Error for AppError {}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        let kind = match err {
            PaymentError::UnknownStatus(value) => {
                AppErrorKind::Validation(ValidationError::Unsupported {
                    field: "status".to_string(),
                    value,
                })
            }
            PaymentError::UnknownEvent(value) => {
                AppErrorKind::Validation(ValidationError::Unsupported {
                    field: "bridge event".to_string(),
                    value,
                })
            }
            PaymentError::InvalidMaxWait { min, max, .. } => {
                AppErrorKind::Validation(ValidationError::OutOfRange {
                    field: "maxWaitMs".to_string(),
                    min: Some(min.to_string()),
                    max: Some(max.to_string()),
                })
            }
        };

        AppError::new(kind)
    }
}

impl From<SlotError> for AppError {
    fn from(err: SlotError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(InfrastructureError::Slot {
            message: err.to_string(),
        }))
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::new(AppErrorKind::Infrastructure(
            InfrastructureError::Configuration {
                message: err.to_string(),
            },
        ))
    }
}

/// Result type for operations that can fail with AppError
pub type AppResult<T> = Result<T, AppError>;
