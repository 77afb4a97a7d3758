//! redlease is a lease lock on a single Redis key.
//!
//! A lock is a key whose value is the holder's token and whose expiry is the
//! lease. Acquiring, renewing and releasing are each one Lua script executed
//! atomically by Redis, so any number of processes on any number of hosts can
//! race for the same key and at most one token owns it at a time. A crashed
//! holder is reclaimed when its lease runs out.
//!
//! # Basic Operation
//! ```rust,no_run
//! # use std::time::Duration;
//! # use redlease::{LockHandle, LockOptions};
//! let mut lock = LockHandle::open(
//!     "redis://127.0.0.1:6379/",
//!     LockOptions::new("mutex").ttl(Duration::from_secs(10)),
//! )?;
//!
//! if lock.acquire(false)? {
//!     // Critical section
//!
//!     lock.renew()?;
//!     lock.release()?;
//! }
//!
//! {
//!     let _guard = lock.lock()?;
//!     // Critical section, released when the guard is dropped
//! }
//! # Ok::<(), redlease::LockError>(())
//! ```
//!
//! Contention is reported as `Ok(false)`; errors are reserved for failures to
//! talk to Redis, so callers can tell "someone else holds it" from "retry
//! later".

mod error;
mod lock;
pub mod scripts;
mod store;

#[cfg(test)]
mod testing;

pub use crate::error::{LockError, LockResult};
pub use crate::lock::{generate_token, LockGuard, LockHandle, LockOptions};
pub use crate::store::LockStore;
