//! Rendezvous key/value store.
//!
//! Peers exchange their transport addresses through a shared store before
//! any collective runs. The group consumes any `Store` implementation
//! through a thin adapter; `HashStore` covers same-process groups and
//! tests, `PrefixStore` namespaces keys for nested use.

use crate::error::{PlexusError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Key/value store used for connection rendezvous.
pub trait Store: Send + Sync {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the value for `key`, waiting for it to appear up to the
    /// store's own default timeout.
    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Wait until every key exists, up to the store's own default timeout.
    fn wait(&self, keys: &[&str]) -> Result<()>;

    /// Wait until every key exists, up to `timeout`.
    fn wait_timeout(&self, keys: &[&str], timeout: Duration) -> Result<()>;
}

/// In-memory store for groups whose ranks share one process.
pub struct HashStore {
    state: Mutex<HashMap<String, Vec<u8>>>,
    cv: Condvar,
    default_timeout: Duration,
}

impl HashStore {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
            default_timeout,
        }
    }

    fn wait_deadline(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().expect("store lock poisoned");
        loop {
            if keys.iter().all(|k| state.contains_key(*k)) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                let missing = keys
                    .iter()
                    .find(|k| !state.contains_key(**k))
                    .expect("some key is missing");
                return Err(PlexusError::KeyNotFound((*missing).to_string()));
            }
            let (guard, _) = self
                .cv
                .wait_timeout(state, deadline - now)
                .expect("store lock poisoned");
            state = guard;
        }
    }
}

impl Default for HashStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for HashStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().expect("store lock poisoned");
        state.insert(key.to_string(), value);
        self.cv.notify_all();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.wait_deadline(&[key], self.default_timeout)?;
        let state = self.state.lock().expect("store lock poisoned");
        state
            .get(key)
            .cloned()
            .ok_or_else(|| PlexusError::KeyNotFound(key.to_string()))
    }

    fn wait(&self, keys: &[&str]) -> Result<()> {
        self.wait_deadline(keys, self.default_timeout)
    }

    fn wait_timeout(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        self.wait_deadline(keys, timeout)
    }
}

/// Store wrapper that prefixes every key.
pub struct PrefixStore {
    prefix: String,
    inner: Arc<dyn Store>,
}

impl PrefixStore {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Store>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}/{}", self.prefix, key)
    }
}

impl Store for PrefixStore {
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.set(&self.scoped(key), value)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.inner.get(&self.scoped(key))
    }

    fn wait(&self, keys: &[&str]) -> Result<()> {
        let scoped: Vec<String> = keys.iter().map(|k| self.scoped(k)).collect();
        let refs: Vec<&str> = scoped.iter().map(String::as_str).collect();
        self.inner.wait(&refs)
    }

    fn wait_timeout(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        let scoped: Vec<String> = keys.iter().map(|k| self.scoped(k)).collect();
        let refs: Vec<&str> = scoped.iter().map(String::as_str).collect();
        self.inner.wait_timeout(&refs, timeout)
    }
}

/// Adapter handed to the transport rendezvous layer.
///
/// `wait` without an explicit timeout delegates to the underlying store's
/// default.
#[derive(Clone)]
pub(crate) struct StoreAdapter {
    store: Arc<dyn Store>,
}

impl StoreAdapter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.store.set(key, value)
    }

    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.store.get(key)
    }

    #[allow(dead_code)]
    pub fn wait(&self, keys: &[&str]) -> Result<()> {
        self.store.wait(keys)
    }

    pub fn wait_timeout(&self, keys: &[&str], timeout: Duration) -> Result<()> {
        self.store.wait_timeout(keys, timeout)
    }
}
