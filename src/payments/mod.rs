//! Payment result model and normalization

pub mod error;
pub mod normalizer;
pub mod types;

pub use error::{PaymentError, PaymentResult};
pub use normalizer::{normalize, normalize_at, CanonicalField};
pub use types::{CanonicalResult, PaymentStatus, RawResult, ResultKey, SourceChannel};
