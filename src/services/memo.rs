//! In-process keyed memoization with singleflight.
//!
//! Readers are non-blocking; writers for the same fingerprint serialize on
//! a per-key gate so concurrent misses trigger exactly one producer and
//! every waiter observes the produced value.

use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::utils::EngineResult;

struct CacheEntry {
    value: Value,
    created_at: Instant,
    ttl: Duration,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.created_at.elapsed() < self.ttl
    }
}

#[derive(Default)]
pub struct MemoCache {
    entries: DashMap<String, CacheEntry>,
    flights: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fingerprint: &str) -> Option<Value> {
        let entry = self.entries.get(fingerprint)?;
        if entry.is_fresh() {
            Some(entry.value.clone())
        } else {
            None
        }
    }

    pub fn put(&self, fingerprint: &str, value: Value, ttl: Duration) {
        self.entries.insert(
            fingerprint.to_string(),
            CacheEntry { value, created_at: Instant::now(), ttl },
        );
    }

    /// Singleflight get-or-compute: at most one producer per key runs at a
    /// time; losers of the race re-check the cache and reuse the winner's
    /// value. Producer errors are not cached.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        ttl: Duration,
        produce: F,
    ) -> EngineResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<Value>>,
    {
        if let Some(hit) = self.get(fingerprint) {
            return Ok(hit);
        }

        let gate = self
            .flights
            .entry(fingerprint.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        // A concurrent producer may have filled the entry while this caller
        // waited on the gate.
        if let Some(hit) = self.get(fingerprint) {
            return Ok(hit);
        }

        // The gate entry must go away even when the producer fails, or
        // failed fingerprints accumulate forever.
        let result = produce().await;
        self.flights.remove(fingerprint);
        let value = result?;
        self.put(fingerprint, value.clone(), ttl);
        Ok(value)
    }

    pub fn invalidate(&self, fingerprint: &str) {
        self.entries.remove(fingerprint);
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        self.entries.retain(|k, _| !k.starts_with(prefix));
    }

    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| entry.is_fresh());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
