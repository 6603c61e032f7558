use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::llm_service::{CompletionRequest, ServiceError};

/// Internal lookup miss. Never leaves the service layer.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("no live cache entry")]
pub struct CacheMiss;

/// Deterministic hash over the normalized prompt and everything that shapes the answer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(request: &CompletionRequest) -> Self {
        let mut hasher = Sha256::new();

        if let Some(system) = &request.system {
            hasher.update(b"system\0");
            hasher.update(normalize(system).as_bytes());
            hasher.update([0u8]);
        }
        for turn in &request.history {
            hasher.update(turn.role.as_str().as_bytes());
            hasher.update([0u8]);
            hasher.update(normalize(&turn.content).as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(b"prompt\0");
        hasher.update(normalize(&request.prompt).as_bytes());
        hasher.update([0u8]);

        for attachment in &request.attachments {
            hasher.update(attachment.digest().as_bytes());
            hasher.update([0u8]);
        }

        hasher.update(request.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(request.params.temperature.to_bits().to_le_bytes());
        hasher.update(request.params.max_tokens.to_le_bytes());

        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub response_text: String,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    inserted: Instant,
    /// Insertion order, for oldest-first eviction
    seq: u64,
}

impl CacheEntry {
    /// Expired entries are inert: treated exactly like a missing entry
    pub fn is_expired(&self) -> bool {
        self.inserted.elapsed() >= self.ttl
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub in_flight: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheInner {
    entries: DashMap<Fingerprint, CacheEntry>,
    /// One gate per fingerprint being computed
    in_flight: DashMap<Fingerprint, Arc<Mutex<()>>>,
    max_entries: usize,
    next_seq: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Forgets a fingerprint's gate once no other caller holds it. Runs on every
/// exit from a computation, including a dropped future after a timeout.
struct GateRelease<'a> {
    in_flight: &'a DashMap<Fingerprint, Arc<Mutex<()>>>,
    fingerprint: &'a Fingerprint,
    gate: Option<Arc<Mutex<()>>>,
}

impl Drop for GateRelease<'_> {
    fn drop(&mut self) {
        drop(self.gate.take());
        self.in_flight
            .remove_if(self.fingerprint, |_, g| Arc::strong_count(g) == 1);
    }
}

/// Memoized model responses with lazy TTL expiry and single-flight computation
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<CacheInner>,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        info!("Initializing response cache (max {} entries)", max_entries.max(1));
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                in_flight: DashMap::new(),
                max_entries: max_entries.max(1),
                next_seq: AtomicU64::new(0),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        }
    }

    fn lookup(&self, fingerprint: &Fingerprint) -> Option<String> {
        let entry = self.inner.entries.get(fingerprint)?;
        if entry.is_expired() {
            drop(entry); // release the shard lock before removing
            self.inner
                .entries
                .remove_if(fingerprint, |_, e| e.is_expired());
            debug!("Cache entry {} expired", fingerprint);
            return None;
        }
        Some(entry.response_text.clone())
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Result<String, CacheMiss> {
        match self.lookup(fingerprint) {
            Some(text) => {
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit for {}", fingerprint);
                Ok(text)
            }
            None => {
                self.inner.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache miss for {}", fingerprint);
                Err(CacheMiss)
            }
        }
    }

    /// Sweeps expired entries, then evicts oldest-first down to capacity
    pub fn insert(&self, fingerprint: Fingerprint, response_text: String, ttl: Duration) {
        self.inner.entries.retain(|_, e| !e.is_expired());

        let incoming = usize::from(!self.inner.entries.contains_key(&fingerprint));
        let overflow = (self.inner.entries.len() + incoming).saturating_sub(self.inner.max_entries);
        if overflow > 0 {
            let mut by_age: Vec<(u64, Fingerprint)> = self
                .inner
                .entries
                .iter()
                .filter(|e| *e.key() != fingerprint)
                .map(|e| (e.seq, e.key().clone()))
                .collect();
            by_age.sort_by_key(|(seq, _)| *seq);
            for (_, key) in by_age.into_iter().take(overflow) {
                if self.inner.entries.remove(&key).is_some() {
                    self.inner.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.inner.entries.insert(
            fingerprint.clone(),
            CacheEntry {
                fingerprint,
                response_text,
                created_at: Utc::now(),
                ttl,
                inserted: Instant::now(),
                seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    /// Drop every entry, returning how many there were. Counters and
    /// computations in flight are left alone.
    pub fn clear(&self) -> usize {
        let removed = self.inner.entries.len();
        self.inner.entries.clear();
        info!("Response cache cleared, {} entries removed", removed);
        removed
    }

    /// Return the live entry or run `compute` once per fingerprint at a time.
    ///
    /// Concurrent callers with the same fingerprint wait for the first computation.
    /// Failures are not cached. The whole call, waiting included, is bounded by `timeout`.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        timeout: Duration,
        compute: F,
    ) -> Result<String, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ServiceError>>,
    {
        if let Ok(text) = self.get(fingerprint) {
            return Ok(text);
        }

        match tokio::time::timeout(timeout, self.compute_single_flight(fingerprint, ttl, compute)).await {
            Ok(result) => result,
            Err(_) => {
                debug!("Cache compute for {} timed out after {:?}", fingerprint, timeout);
                Err(ServiceError::Timeout(timeout))
            }
        }
    }

    async fn compute_single_flight<F, Fut>(
        &self,
        fingerprint: &Fingerprint,
        ttl: Duration,
        compute: F,
    ) -> Result<String, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, ServiceError>>,
    {
        let gate = self
            .inner
            .in_flight
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        // Declared before the lock guard so it drops after it, also on cancellation
        let _release = GateRelease {
            in_flight: &self.inner.in_flight,
            fingerprint,
            gate: Some(gate.clone()),
        };
        let _guard = gate.lock_owned().await;

        // Someone ahead of us may have filled it while we waited
        if let Some(text) = self.lookup(fingerprint) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            debug!("Cache filled by concurrent caller for {}", fingerprint);
            return Ok(text);
        }

        let result = compute().await;
        if let Ok(text) = &result {
            self.insert(fingerprint.clone(), text.clone(), ttl);
        }
        result
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.entries.len(),
            in_flight: self.inner.in_flight.len(),
            max_entries: self.inner.max_entries,
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::llm_service::SamplingParams;
    use std::sync::atomic::AtomicUsize;

    const TTL: Duration = Duration::from_secs(60);
    const TIMEOUT: Duration = Duration::from_secs(5);

    fn fp(name: &str) -> Fingerprint {
        Fingerprint(name.to_string())
    }

    fn request(prompt: &str, model: &str) -> CompletionRequest {
        CompletionRequest {
            system: None,
            prompt: prompt.to_string(),
            history: Vec::new(),
            attachments: Vec::new(),
            model: model.to_string(),
            params: SamplingParams {
                temperature: 0.7,
                max_tokens: 256,
            },
        }
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace() {
        let a = Fingerprint::of(&request("what  is\n rust", "m1"));
        let b = Fingerprint::of(&request(" what is rust ", "m1"));
        let c = Fingerprint::of(&request("what is rust", "m2"));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut hotter = request("what is rust", "m1");
        hotter.params.temperature = 0.9;
        assert_ne!(a, Fingerprint::of(&hotter));

        let mut instructed = request("what is rust", "m1");
        instructed.system = Some("Be brief".to_string());
        assert_ne!(a, Fingerprint::of(&instructed));
    }

    #[tokio::test]
    async fn test_compute_runs_once_while_live() {
        let cache = ResponseCache::new(10);
        let counter = AtomicUsize::new(0);
        let key = fp("k");

        for _ in 0..2 {
            let text = cache
                .get_or_compute(&key, TTL, TIMEOUT, || async {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("answer".to_string())
                })
                .await
                .unwrap();
            assert_eq!(text, "answer");
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = ResponseCache::new(10);
        let key = fp("k");

        let err = cache
            .get_or_compute(&key, TTL, TIMEOUT, || async {
                Err(ServiceError::Upstream("boom".to_string()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));
        assert_eq!(cache.get(&key), Err(CacheMiss));

        let text = cache
            .get_or_compute(&key, TTL, TIMEOUT, || async { Ok("second try".to_string()) })
            .await
            .unwrap();
        assert_eq!(text, "second try");
    }

    #[tokio::test]
    async fn test_expired_entries_are_absent() {
        let cache = ResponseCache::new(10);
        let key = fp("k");
        cache.insert(key.clone(), "stale".to_string(), Duration::from_millis(20));
        assert_eq!(cache.get(&key).unwrap(), "stale");

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&key), Err(CacheMiss));
        assert_eq!(cache.stats().entries, 0);

        let text = cache
            .get_or_compute(&key, TTL, TIMEOUT, || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(text, "fresh");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_computation() {
        let cache = ResponseCache::new(10);
        let counter = Arc::new(AtomicUsize::new(0));
        let key = fp("shared");

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let counter = counter.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_compute(&key, TTL, TIMEOUT, || async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok("once".to_string())
                        })
                        .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "once");
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_slow_compute_times_out_and_leaves_no_entry() {
        let cache = ResponseCache::new(10);
        let key = fp("slow");

        let err = cache
            .get_or_compute(&key, TTL, Duration::from_millis(20), || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok("late".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));
        assert_eq!(cache.get(&key), Err(CacheMiss));
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_timed_out_waiters_release_their_gate() {
        let cache = ResponseCache::new(10);
        let key = fp("contended");

        let slow = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute(&key, TTL, Duration::from_millis(30), || async {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        Ok("late".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Waits behind the slow caller and gives up first
        let err = cache
            .get_or_compute(&key, TTL, Duration::from_millis(10), || async { Ok("never".to_string()) })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Timeout(_)));

        assert!(matches!(slow.await.unwrap(), Err(ServiceError::Timeout(_))));
        assert_eq!(cache.stats().in_flight, 0);

        let text = cache
            .get_or_compute(&key, TTL, TIMEOUT, || async { Ok("fresh".to_string()) })
            .await
            .unwrap();
        assert_eq!(text, "fresh");
        assert_eq!(cache.stats().in_flight, 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = ResponseCache::new(2);
        cache.insert(fp("a"), "1".to_string(), TTL);
        cache.insert(fp("b"), "2".to_string(), TTL);
        cache.insert(fp("c"), "3".to_string(), TTL);

        assert_eq!(cache.get(&fp("a")), Err(CacheMiss));
        assert_eq!(cache.get(&fp("c")).unwrap(), "3");
        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_reinsert_same_key_does_not_evict() {
        let cache = ResponseCache::new(1);
        cache.insert(fp("a"), "1".to_string(), TTL);
        cache.insert(fp("a"), "2".to_string(), TTL);
        assert_eq!(cache.get(&fp("a")).unwrap(), "2");
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_clear_removes_entries_but_keeps_counters() {
        let cache = ResponseCache::new(4);
        cache.insert(fp("a"), "1".to_string(), TTL);
        cache.insert(fp("b"), "2".to_string(), TTL);
        assert!(cache.get(&fp("a")).is_ok());

        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.get(&fp("b")), Err(CacheMiss));
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.hits, 1);
        assert_eq!(cache.clear(), 0);
    }
}
