use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Result;
use redis::RedisResult;
use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};

use crate::store::LockStore;

pub(crate) async fn init() -> Result<(Option<ContainerAsync<GenericImage>>, String)> {
    match std::env::var("ADDRESS") {
        Ok(address) => Ok((None, address)),
        _ => {
            let container = GenericImage::new("redis", "7-alpine")
                .with_exposed_port(6379.tcp())
                .start()
                .await?;
            let address = format!(
                "redis://localhost:{}",
                container.get_host_port_ipv4(6379).await?
            );
            Ok((Some(container), address))
        }
    }
}

/// A fresh key so tests can share one server.
pub(crate) fn unique_key(prefix: &str) -> String {
    let suffix: String = crate::generate_token()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{}:{}", prefix, suffix)
}

/// Single-process stand-in for Redis with the same conditional semantics.
#[derive(Default)]
pub(crate) struct MemoryStore {
    entries: Mutex<Entries>,
    calls: Mutex<usize>,
}

type Entries = HashMap<String, (Vec<u8>, Instant)>;

impl MemoryStore {
    /// Locks the whole map for one primitive, evicting `key` if it lapsed.
    fn entries(&self, key: &str) -> MutexGuard<'_, Entries> {
        *self.calls.lock().unwrap() += 1;
        let mut entries = self.entries.lock().unwrap();
        let expired = matches!(entries.get(key), Some((_, deadline)) if *deadline <= Instant::now());
        if expired {
            entries.remove(key);
        }
        entries
    }

    pub(crate) fn holder(&self, key: &str) -> Option<Vec<u8>> {
        self.entries(key).get(key).map(|(token, _)| token.clone())
    }

    pub(crate) fn call_count(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl LockStore for MemoryStore {
    fn acquire_or_renew(&self, key: &str, token: &[u8], ttl_ms: u64) -> RedisResult<bool> {
        let mut entries = self.entries(key);
        let held_by_other = matches!(entries.get(key), Some((current, _)) if current.as_slice() != token);
        if held_by_other {
            return Ok(false);
        }
        let deadline = Instant::now() + Duration::from_millis(ttl_ms);
        entries.insert(key.to_owned(), (token.to_vec(), deadline));
        Ok(true)
    }

    fn release_if_owner(&self, key: &str, token: &[u8]) -> RedisResult<bool> {
        let mut entries = self.entries(key);
        let owned = matches!(entries.get(key), Some((current, _)) if current.as_slice() == token);
        if owned {
            entries.remove(key);
        }
        Ok(owned)
    }

    fn time_to_live(&self, key: &str) -> RedisResult<Option<Duration>> {
        Ok(self
            .entries(key)
            .get(key)
            .map(|(_, deadline)| deadline.saturating_duration_since(Instant::now())))
    }
}
