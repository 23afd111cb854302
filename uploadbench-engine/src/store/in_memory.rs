//! In-memory store for tests.
//!
//! The store is [`Clone`] and every clone shares the same state, so tests can keep a handle for
//! inspection while workers upload through connections handed out by the connector.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::{BoxedStore, BucketAdmin, ObjectStore, StoreConnector};
use crate::error::{StoreError, StoreResult};
use crate::payload::Payload;

#[derive(Debug, Default)]
struct Shared {
    objects: Mutex<HashMap<String, u64>>,
    buckets: Mutex<BTreeSet<String>>,
    puts: AtomicUsize,
    creates: AtomicUsize,
}

/// A store that records object sizes in a `HashMap`.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
    fail_every: Option<usize>,
    latency: Option<Duration>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every `n`-th upload with [`StoreError::Simulated`].
    pub fn failing_every(mut self, n: usize) -> Self {
        self.fail_every = Some(n.max(1));
        self
    }

    /// Delays every upload by the given duration.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Number of objects stored successfully.
    pub fn object_count(&self) -> usize {
        self.objects().len()
    }

    /// Total number of payload bytes stored.
    pub fn stored_bytes(&self) -> u64 {
        self.objects().values().sum()
    }

    /// Returns `true` if an object with the given key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.objects().contains_key(key)
    }

    /// Number of times [`BucketAdmin::create_bucket`] was called.
    pub fn create_calls(&self) -> usize {
        self.shared.creates.load(Ordering::Relaxed)
    }

    fn objects(&self) -> MutexGuard<'_, HashMap<String, u64>> {
        self.shared
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn buckets(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.shared
            .buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl ObjectStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "in-memory"
    }

    async fn put_object(&self, key: &str, payload: &Payload) -> StoreResult<()> {
        let attempt = self.shared.puts.fetch_add(1, Ordering::Relaxed) + 1;

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.fail_every.is_some_and(|n| attempt % n == 0) {
            return Err(StoreError::Simulated(key.to_owned()));
        }

        self.objects().insert(key.to_owned(), payload.len());
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreConnector for InMemoryStore {
    async fn connect(&self) -> StoreResult<BoxedStore> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait::async_trait]
impl BucketAdmin for InMemoryStore {
    async fn list_buckets(&self) -> StoreResult<BTreeSet<String>> {
        Ok(self.buckets().clone())
    }

    async fn create_bucket(&self, name: &str) -> StoreResult<()> {
        self.shared.creates.fetch_add(1, Ordering::Relaxed);
        self.buckets().insert(name.to_owned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn clones_share_objects() {
        let store = InMemoryStore::new();
        let connection = store.connect().await.unwrap();

        let payload = Payload::Memory(Bytes::from_static(b"hello"));
        connection.put_object("a", &payload).await.unwrap();

        assert!(store.contains("a"));
        assert_eq!(store.object_count(), 1);
        assert_eq!(store.stored_bytes(), 5);
    }

    #[tokio::test]
    async fn injected_failures() {
        let store = InMemoryStore::new().failing_every(3);
        let payload = Payload::Memory(Bytes::from_static(b"x"));

        let mut failures = 0;
        for i in 0..9 {
            if store.put_object(&i.to_string(), &payload).await.is_err() {
                failures += 1;
            }
        }

        assert_eq!(failures, 3);
        assert_eq!(store.object_count(), 6);
        assert!(!store.contains("2"));
    }
}
