use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize)]
pub struct L2Stats {
    #[serde(rename = "type")]
    pub cache_type: String,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub failures: u64,
    pub connected: bool,
}

/// Shared (cross-process) cache contract.
///
/// Every operation is best-effort: transport failures degrade to `None` /
/// `false` and are counted, never raised. The rest of the system must stay
/// correct with this cache cold or gone.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Store with a TTL. The TTL is an upper bound on visibility; early
    /// eviction under memory pressure is allowed.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool;

    /// Set-if-not-exists: the primitive behind advisory locks. Returns
    /// true when this caller created the key.
    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool;

    async fn delete(&self, key: &str) -> bool;

    /// Delete all keys matching a `*`-glob pattern; returns how many.
    async fn delete_pattern(&self, pattern: &str) -> u64;

    async fn healthy(&self) -> bool;

    fn stats(&self) -> L2Stats;
}

struct StoredValue {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory `SharedCache` backend: per-key TTL, glob pattern delete, and
/// an outage switch so degraded-mode behavior is testable.
pub struct MemoryCache {
    entries: DashMap<String, StoredValue>,
    connected: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            connected: AtomicBool::new(true),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, stored| stored.expires_at > now);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if !self.is_connected() {
            self.record_failure();
            return None;
        }

        let expired = match self.entries.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::SeqCst);
                return Some(stored.value.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries.remove(key);
        }
        self.misses.fetch_add(1, Ordering::SeqCst);
        None
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        if !self.is_connected() {
            self.record_failure();
            return false;
        }

        self.sweep_expired();
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        true
    }

    async fn set_nx(&self, key: &str, value: Vec<u8>, ttl: Duration) -> bool {
        if !self.is_connected() {
            self.record_failure();
            return false;
        }

        self.sweep_expired();
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value,
                    expires_at: Instant::now() + ttl,
                });
                true
            }
        }
    }

    async fn delete(&self, key: &str) -> bool {
        if !self.is_connected() {
            self.record_failure();
            return false;
        }
        self.entries.remove(key).is_some()
    }

    async fn delete_pattern(&self, pattern: &str) -> u64 {
        if !self.is_connected() {
            self.record_failure();
            return 0;
        }

        let mut removed = 0u64;
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| key_matches(entry.key(), pattern))
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if self.entries.remove(&key).is_some() {
                removed += 1;
            }
        }
        removed
    }

    async fn healthy(&self) -> bool {
        self.is_connected()
    }

    fn stats(&self) -> L2Stats {
        let hits = self.hits.load(Ordering::SeqCst);
        let misses = self.misses.load(Ordering::SeqCst);
        let lookups = hits + misses;
        let hit_rate = if lookups > 0 {
            hits as f64 / lookups as f64
        } else {
            0.0
        };

        L2Stats {
            cache_type: "l2".to_string(),
            entries: self.entries.len(),
            hits,
            misses,
            hit_rate,
            failures: self.failures.load(Ordering::SeqCst),
            connected: self.is_connected(),
        }
    }
}

/// `*`-glob match over keys. Patterns are segment literals joined by `*`;
/// `*` matches any run of characters including `:`.
fn key_matches(key: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return key == pattern;
    }

    let segments: Vec<&str> = pattern.split('*').collect();
    let mut rest = key;

    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(segment) {
                Some(tail) => rest = tail,
                None => return false,
            }
        } else if i == segments.len() - 1 && !pattern.ends_with('*') {
            return rest.ends_with(segment);
        } else {
            match rest.find(segment) {
                Some(pos) => rest = &rest[pos + segment.len()..],
                None => return false,
            }
        }
    }

    true
}
