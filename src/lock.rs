use std::ops::{Deref, DerefMut};
use std::thread::sleep;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::{thread_rng, Rng};
use redis::{Client, IntoConnectionInfo};
use tracing::{debug, instrument, trace, warn};

use crate::error::{LockError, LockResult};
use crate::store::LockStore;

const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const DEFAULT_WAIT_DELAY: Duration = Duration::from_millis(10);
const TOKEN_LEN: usize = 20;

/// Get 20 random bytes, suitable as a lock token.
pub fn generate_token() -> Vec<u8> {
    let bytes: [u8; TOKEN_LEN] = thread_rng().gen();
    bytes.to_vec()
}

/// Configuration for a [`LockHandle`].
#[derive(Debug, Clone)]
pub struct LockOptions {
    key: String,
    token: Option<Vec<u8>>,
    ttl: Duration,
    wait_delay: Duration,
}

impl LockOptions {
    /// Options for the lock stored under `key`.
    ///
    /// The lease defaults to one hour, the polling delay to 10ms and the
    /// token to a freshly generated one.
    pub fn new(key: impl Into<String>) -> LockOptions {
        LockOptions {
            key: key.into(),
            token: None,
            ttl: DEFAULT_TTL,
            wait_delay: DEFAULT_WAIT_DELAY,
        }
    }

    /// Use a fixed token. Handles sharing a token count as the same holder.
    pub fn token(mut self, token: impl Into<Vec<u8>>) -> LockOptions {
        self.token = Some(token.into());
        self
    }

    /// Lease requested on every acquire and renew.
    pub fn ttl(mut self, ttl: Duration) -> LockOptions {
        self.ttl = ttl;
        self
    }

    /// Added on top of the holder's remaining lease between blocking retries.
    pub fn wait_delay(mut self, wait_delay: Duration) -> LockOptions {
        self.wait_delay = wait_delay;
        self
    }
}

/// A lease lock on a single Redis key.
///
/// The handle only caches what the store last confirmed; every acquire,
/// renew and release is decided by a script running on the store. A handle
/// is meant for one caller at a time, independent handles may race freely.
#[derive(Debug)]
pub struct LockHandle<S> {
    store: S,
    key: String,
    token: Vec<u8>,
    ttl: Duration,
    ttl_ms: u64,
    lease: chrono::Duration,
    wait_delay: Duration,
    locked: bool,
    expiration: Option<DateTime<Utc>>,
}

impl LockHandle<Client> {
    /// Create a handle talking to a single Redis node.
    ///
    /// Sample URI: `"redis://127.0.0.1:6379/0"`
    pub fn open<T: IntoConnectionInfo>(info: T, options: LockOptions) -> LockResult<Self> {
        Self::new(Client::open(info)?, options)
    }
}

#[cfg(feature = "cluster")]
impl LockHandle<redis::cluster::ClusterClient> {
    /// Create a handle talking to a Redis cluster, given any of its nodes.
    pub fn open_cluster<T: IntoConnectionInfo>(
        nodes: Vec<T>,
        options: LockOptions,
    ) -> LockResult<Self> {
        Self::new(redis::cluster::ClusterClient::new(nodes)?, options)
    }
}

impl<S: LockStore> LockHandle<S> {
    /// Create a handle on top of an existing store, such as a shared
    /// `redis::Client` or an `Arc` of one.
    pub fn new(store: S, options: LockOptions) -> LockResult<Self> {
        let LockOptions {
            key,
            token,
            ttl,
            wait_delay,
        } = options;

        let ttl_ms = u64::try_from(ttl.as_millis()).map_err(|_| LockError::InvalidTtl(ttl))?;
        if ttl_ms == 0 {
            return Err(LockError::InvalidTtl(ttl));
        }
        let lease = chrono::Duration::from_std(ttl).map_err(|_| LockError::InvalidTtl(ttl))?;
        if Utc::now().checked_add_signed(lease).is_none() {
            return Err(LockError::InvalidTtl(ttl));
        }

        Ok(LockHandle {
            store,
            key,
            token: token.unwrap_or_else(generate_token),
            ttl,
            ttl_ms,
            lease,
            wait_delay,
            locked: false,
            expiration: None,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether the last store operation confirmed ownership.
    ///
    /// Advisory only: the lease may have lapsed or been taken over since.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Lease deadline as of the last successful acquire or renew.
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        self.expiration
    }

    /// Try to take the lock, or extend it if this token already holds it.
    ///
    /// With `blocking` set this keeps retrying until the lock is obtained,
    /// see [`LockHandle::wait`]. `Ok(false)` means another token holds the
    /// lock; store failures are returned as `Err` and never retried here.
    #[instrument(level = "debug", skip(self), fields(key = %self.key))]
    pub fn acquire(&mut self, blocking: bool) -> LockResult<bool> {
        let acquired = self.try_acquire()?;
        debug!(acquired, "acquire attempt");
        if acquired || !blocking {
            return Ok(acquired);
        }
        self.wait()
    }

    /// Release the lock if this handle still holds an unexpired lease.
    ///
    /// Returns `Ok(false)` without contacting the store when the handle does
    /// not believe it holds the lock, and when the store no longer has this
    /// token under the key.
    ///
    /// The cached lease is dropped even when the store cannot be reached, so
    /// a second `release` after an `Err` is a no-op. Call `acquire` first to
    /// confirm ownership again before retrying; until then the key lives out
    /// its ttl.
    #[instrument(level = "debug", skip(self), fields(key = %self.key))]
    pub fn release(&mut self) -> LockResult<bool> {
        if !self.holds_unexpired_lease() {
            debug!("no unexpired lease held, not releasing");
            self.forget();
            return Ok(false);
        }

        let released = self.store.release_if_owner(&self.key, &self.token);
        self.forget();
        let released = released?;
        debug!(released, "release");
        Ok(released)
    }

    /// Extend the lease by another `ttl`.
    ///
    /// Fails like [`LockHandle::release`] does when the lease is not held.
    #[instrument(level = "debug", skip(self), fields(key = %self.key))]
    pub fn renew(&mut self) -> LockResult<bool> {
        if !self.holds_unexpired_lease() {
            debug!("no unexpired lease held, not renewing");
            self.forget();
            return Ok(false);
        }

        let renewed = self.try_acquire()?;
        debug!(renewed, "renew");
        Ok(renewed)
    }

    /// Block until the lock is acquired.
    ///
    /// Each round sleeps for the current holder's remaining lease plus the
    /// polling delay before retrying. There is no fairness between waiters.
    pub fn wait(&mut self) -> LockResult<bool> {
        self.wait_with(|| true)
    }

    /// Like [`LockHandle::wait`], but `keep_waiting` is consulted before
    /// every sleep. Returns `Ok(false)` once it answers `false`.
    #[instrument(level = "debug", skip_all, fields(key = %self.key))]
    pub fn wait_with<F: FnMut() -> bool>(&mut self, mut keep_waiting: F) -> LockResult<bool> {
        while !self.locked {
            if !keep_waiting() {
                debug!("wait cancelled");
                return Ok(false);
            }
            let interval = self.poll_interval()?;
            trace!(?interval, "lock busy, sleeping");
            sleep(interval);
            self.try_acquire()?;
        }
        Ok(true)
    }

    /// Acquire, waiting at most `timeout` for the lock to become free.
    ///
    /// A timeout too large to be represented as a deadline waits forever.
    #[instrument(level = "debug", skip(self), fields(key = %self.key))]
    pub fn acquire_timeout(&mut self, timeout: Duration) -> LockResult<bool> {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            return self.acquire(true);
        };
        self.try_acquire()?;
        while !self.locked {
            let now = Instant::now();
            if now >= deadline {
                debug!("timed out waiting for lock");
                return Ok(false);
            }
            let interval = self.poll_interval()?.min(deadline - now);
            trace!(?interval, "lock busy, sleeping");
            sleep(interval);
            self.try_acquire()?;
        }
        Ok(true)
    }

    /// Remaining lease of whoever holds the key, zero when nobody does.
    pub fn time_to_expire(&self) -> LockResult<Duration> {
        Ok(self.store.time_to_live(&self.key)?.unwrap_or_default())
    }

    /// Acquire the lock, blocking until it is free, and release it when the
    /// returned guard goes out of scope.
    pub fn lock(&mut self) -> LockResult<LockGuard<'_, S>> {
        self.acquire(true)?;
        Ok(LockGuard { handle: self })
    }

    /// Acquire the lock, yielding to the tokio runtime between retries
    /// instead of blocking the thread. Dropping the future stops waiting.
    #[cfg(feature = "async")]
    pub async fn acquire_async(&mut self, blocking: bool) -> LockResult<bool> {
        let acquired = self.try_acquire()?;
        debug!(key = %self.key, acquired, "acquire attempt");
        if acquired || !blocking {
            return Ok(acquired);
        }
        self.wait_async().await
    }

    #[cfg(feature = "async")]
    pub async fn wait_async(&mut self) -> LockResult<bool> {
        while !self.locked {
            let interval = self.poll_interval()?;
            trace!(key = %self.key, ?interval, "lock busy, sleeping");
            tokio::time::sleep(interval).await;
            self.try_acquire()?;
        }
        Ok(true)
    }

    fn try_acquire(&mut self) -> LockResult<bool> {
        // Taken before the round trip so the cached deadline never outlives
        // the one the store applies.
        let Some(expiration) = Utc::now().checked_add_signed(self.lease) else {
            self.forget();
            return Err(LockError::InvalidTtl(self.ttl));
        };
        let acquired = match self
            .store
            .acquire_or_renew(&self.key, &self.token, self.ttl_ms)
        {
            Ok(acquired) => acquired,
            Err(e) => {
                self.forget();
                return Err(e.into());
            }
        };
        self.locked = acquired;
        self.expiration = if acquired { Some(expiration) } else { None };
        Ok(acquired)
    }

    fn poll_interval(&self) -> LockResult<Duration> {
        Ok(self.time_to_expire()? + self.wait_delay)
    }

    fn holds_unexpired_lease(&self) -> bool {
        self.locked && self.expiration.map_or(false, |e| e > Utc::now())
    }

    fn forget(&mut self) {
        self.locked = false;
        self.expiration = None;
    }
}

/// RAII guard returned by [`LockHandle::lock`].
pub struct LockGuard<'a, S: LockStore> {
    handle: &'a mut LockHandle<S>,
}

impl<S: LockStore> LockGuard<'_, S> {
    /// Release now and report the outcome instead of discarding it on drop.
    pub fn unlock(mut self) -> LockResult<bool> {
        // Drop finds the handle unlocked and leaves the store alone.
        self.handle.release()
    }
}

impl<S: LockStore> Deref for LockGuard<'_, S> {
    type Target = LockHandle<S>;

    fn deref(&self) -> &LockHandle<S> {
        &*self.handle
    }
}

impl<S: LockStore> DerefMut for LockGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut LockHandle<S> {
        &mut *self.handle
    }
}

impl<S: LockStore> Drop for LockGuard<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release() {
            warn!(key = %self.handle.key, error = %e, "failed to release lock on drop");
        }
    }
}
