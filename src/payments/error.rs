use thiserror::Error;

pub type PaymentResult<T> = Result<T, PaymentError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("Unknown payment status: {0}")]
    UnknownStatus(String),

    #[error("Unknown bridge event: {0}")]
    UnknownEvent(String),

    #[error("Invalid max wait: {millis}ms (allowed {min}..={max})")]
    InvalidMaxWait { millis: u64, min: u64, max: u64 },
}
