use std::sync::Arc;
use std::time::Duration;

use redis::{Client, RedisResult};

use crate::scripts;

/// The store primitives a lease lock is built from.
///
/// Every call is one round trip that the store executes atomically for the
/// given key. Implementations must not emulate these with separate reads and
/// writes on the client side.
pub trait LockStore {
    /// Sets `key` to `token` with a `ttl_ms` expiry if the key is absent or
    /// already holds `token`. Returns `false` when another token holds it.
    fn acquire_or_renew(&self, key: &str, token: &[u8], ttl_ms: u64) -> RedisResult<bool>;

    /// Deletes `key` if it holds `token`. Returns `false` otherwise.
    fn release_if_owner(&self, key: &str, token: &[u8]) -> RedisResult<bool>;

    /// Remaining lifetime of `key`, `None` if it does not exist or never expires.
    fn time_to_live(&self, key: &str) -> RedisResult<Option<Duration>>;
}

impl LockStore for Client {
    fn acquire_or_renew(&self, key: &str, token: &[u8], ttl_ms: u64) -> RedisResult<bool> {
        let mut con = self.get_connection()?;
        scripts::acquire_or_renew(&mut con, key, token, ttl_ms)
    }

    fn release_if_owner(&self, key: &str, token: &[u8]) -> RedisResult<bool> {
        let mut con = self.get_connection()?;
        scripts::release_if_owner(&mut con, key, token)
    }

    fn time_to_live(&self, key: &str) -> RedisResult<Option<Duration>> {
        let mut con = self.get_connection()?;
        scripts::time_to_live(&mut con, key)
    }
}

#[cfg(feature = "cluster")]
impl LockStore for redis::cluster::ClusterClient {
    fn acquire_or_renew(&self, key: &str, token: &[u8], ttl_ms: u64) -> RedisResult<bool> {
        let mut con = self.get_connection()?;
        scripts::acquire_or_renew(&mut con, key, token, ttl_ms)
    }

    fn release_if_owner(&self, key: &str, token: &[u8]) -> RedisResult<bool> {
        let mut con = self.get_connection()?;
        scripts::release_if_owner(&mut con, key, token)
    }

    fn time_to_live(&self, key: &str) -> RedisResult<Option<Duration>> {
        let mut con = self.get_connection()?;
        scripts::time_to_live(&mut con, key)
    }
}

impl<S: LockStore + ?Sized> LockStore for &S {
    fn acquire_or_renew(&self, key: &str, token: &[u8], ttl_ms: u64) -> RedisResult<bool> {
        (**self).acquire_or_renew(key, token, ttl_ms)
    }

    fn release_if_owner(&self, key: &str, token: &[u8]) -> RedisResult<bool> {
        (**self).release_if_owner(key, token)
    }

    fn time_to_live(&self, key: &str) -> RedisResult<Option<Duration>> {
        (**self).time_to_live(key)
    }
}

impl<S: LockStore + ?Sized> LockStore for Arc<S> {
    fn acquire_or_renew(&self, key: &str, token: &[u8], ttl_ms: u64) -> RedisResult<bool> {
        (**self).acquire_or_renew(key, token, ttl_ms)
    }

    fn release_if_owner(&self, key: &str, token: &[u8]) -> RedisResult<bool> {
        (**self).release_if_owner(key, token)
    }

    fn time_to_live(&self, key: &str) -> RedisResult<Option<Duration>> {
        (**self).time_to_live(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{init, unique_key};
    use anyhow::Result;

    #[tokio::test]
    async fn test_store_acquire_when_free() -> Result<()> {
        let (_container, address) = init().await?;
        let client = Client::open(address)?;
        let key = unique_key("store");

        assert!(client.acquire_or_renew(&key, b"a", 1000)?);
        let ttl = client.time_to_live(&key)?.expect("key should expire");
        assert!(ttl > Duration::from_millis(900), "ttl: {:?}", ttl);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_acquire_held_by_other_fails() -> Result<()> {
        let (_container, address) = init().await?;
        let client = Client::open(address)?;
        let key = unique_key("store");

        assert!(client.acquire_or_renew(&key, b"a", 1000)?);
        assert!(!client.acquire_or_renew(&key, b"b", 1000)?);

        let mut con = client.get_connection()?;
        let val: Vec<u8> = redis::cmd("GET").arg(&key).query(&mut con)?;
        assert_eq!(b"a".to_vec(), val);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_renew_refreshes_expiry() -> Result<()> {
        let (_container, address) = init().await?;
        let client = Client::open(address)?;
        let key = unique_key("store");

        assert!(client.acquire_or_renew(&key, b"a", 200)?);
        assert!(client.acquire_or_renew(&key, b"a", 5000)?);
        let ttl = client.time_to_live(&key)?.expect("key should expire");
        assert!(ttl > Duration::from_millis(4000), "ttl: {:?}", ttl);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_release_by_other_keeps_key() -> Result<()> {
        let (_container, address) = init().await?;
        let client = Client::open(address)?;
        let key = unique_key("store");

        assert!(client.acquire_or_renew(&key, b"a", 1000)?);
        assert!(!client.release_if_owner(&key, b"b")?);
        assert!(client.time_to_live(&key)?.is_some());

        assert!(client.release_if_owner(&key, b"a")?);
        assert_eq!(None, client.time_to_live(&key)?);
        Ok(())
    }

    #[tokio::test]
    async fn test_store_ttl_without_expiry() -> Result<()> {
        let (_container, address) = init().await?;
        let client = Client::open(address)?;
        let key = unique_key("store");

        let mut con = client.get_connection()?;
        redis::cmd("SET").arg(&key).arg("x").exec(&mut con)?;
        assert_eq!(None, client.time_to_live(&key)?);
        Ok(())
    }

    #[test]
    fn test_store_unreachable_is_an_error() {
        let client = Client::open("redis://nonexistent").unwrap();
        match client.acquire_or_renew("key", b"a", 1000) {
            Ok(_) => panic!("Expected error"),
            Err(e) => assert!(e.is_io_error()),
        }
    }
}
