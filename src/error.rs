use std::time::Duration;

use redis::RedisError;
use thiserror::Error;

/// Failures that are neither contention nor a missing ownership.
///
/// Losing a race for the lock is reported as `Ok(false)`; this type is only
/// returned when the store could not be asked or the handle is misconfigured.
#[derive(Error, Debug)]
pub enum LockError {
    /// Connection, protocol or script failure reported by Redis.
    #[error("error communicating with redis: {0}")]
    Store(#[from] RedisError),

    /// Leases shorter than one millisecond cannot be expressed with `PSETEX`.
    #[error("lease duration must be at least one millisecond, got {0:?}")]
    InvalidTtl(Duration),
}

pub type LockResult<T> = Result<T, LockError>;
