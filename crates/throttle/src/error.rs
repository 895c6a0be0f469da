//! Error types for throttling.

use crate::storage::StorageError;

/// Errors that can occur while building or reconfiguring a throttle.
///
/// Throttling decisions themselves never fail: store errors during a decision are
/// resolved by the configured store error policy.
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// The counter store could not be set up.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The configuration is out of bounds.
    #[error("Invalid throttle configuration: {0}")]
    InvalidConfig(String),
}
