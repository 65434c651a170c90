use mnemolite_core::fingerprint::Fingerprint;
use mnemolite_core::model::Chunk;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Instant;

/// One cached file: the chunks produced for a specific content fingerprint.
#[derive(Debug, Clone)]
struct L1Entry {
    file_path: String,
    fingerprint: Fingerprint,
    chunks: Vec<Chunk>,
    size_bytes: u64,
    #[allow(dead_code)]
    cached_at: Instant,
}

struct L1State {
    /// LRU order: front is the eviction candidate, back is most recent.
    entries: VecDeque<L1Entry>,
    size_bytes: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct L1Stats {
    #[serde(rename = "type")]
    pub cache_type: String,
    pub size_bytes: u64,
    pub max_bytes: u64,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub utilization: f64,
}

/// In-process chunk cache: byte-budgeted, strict LRU, fingerprint-validated.
///
/// A read is served only when the queried source bytes still hash to the
/// stored fingerprint; any mismatch evicts the entry and reports a miss.
/// The cache cannot fail — it is purely in-memory.
pub struct ChunkCache {
    max_bytes: u64,
    state: Mutex<L1State>,
}

impl ChunkCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(L1State {
                entries: VecDeque::new(),
                size_bytes: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn get(&self, file_path: &str, source: &[u8]) -> Option<Vec<Chunk>> {
        let fingerprint = Fingerprint::of(source);
        let mut state = self.state.lock().unwrap();

        let Some(idx) = state
            .entries
            .iter()
            .position(|entry| entry.file_path == file_path)
        else {
            state.misses += 1;
            return None;
        };

        if state.entries[idx].fingerprint != fingerprint {
            // Stale content: fail closed and drop the entry.
            let removed = state.entries.remove(idx).unwrap();
            state.size_bytes -= removed.size_bytes;
            state.evictions += 1;
            state.misses += 1;
            return None;
        }

        let entry = state.entries.remove(idx).unwrap();
        let chunks = entry.chunks.clone();
        state.entries.push_back(entry);
        state.hits += 1;
        Some(chunks)
    }

    pub fn put(&self, file_path: &str, source: &[u8], chunks: Vec<Chunk>) {
        let fingerprint = Fingerprint::of(source);
        let size_bytes = entry_size(source, &chunks);
        let mut state = self.state.lock().unwrap();

        if let Some(idx) = state
            .entries
            .iter()
            .position(|entry| entry.file_path == file_path)
        {
            let removed = state.entries.remove(idx).unwrap();
            state.size_bytes -= removed.size_bytes;
        }

        if size_bytes > self.max_bytes {
            // A single oversized entry would evict everything and still not
            // fit; it is cheaper to recompute than to cache.
            return;
        }

        while state.size_bytes + size_bytes > self.max_bytes {
            match state.entries.pop_front() {
                Some(evicted) => {
                    state.size_bytes -= evicted.size_bytes;
                    state.evictions += 1;
                }
                None => break,
            }
        }

        state.entries.push_back(L1Entry {
            file_path: file_path.to_string(),
            fingerprint,
            chunks,
            size_bytes,
            cached_at: Instant::now(),
        });
        state.size_bytes += size_bytes;
    }

    /// Drop the entry for `file_path` only when its fingerprint no longer
    /// matches. Used at the head of re-indexing so an in-flight rebuild
    /// can never serve a stale version, while an unchanged file still hits.
    pub fn evict_if_stale(&self, file_path: &str, fingerprint: &Fingerprint) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state
            .entries
            .iter()
            .position(|entry| entry.file_path == file_path && &entry.fingerprint != fingerprint)
        {
            let removed = state.entries.remove(idx).unwrap();
            state.size_bytes -= removed.size_bytes;
            state.evictions += 1;
            true
        } else {
            false
        }
    }

    pub fn invalidate(&self, file_path: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(idx) = state
            .entries
            .iter()
            .position(|entry| entry.file_path == file_path)
        {
            let removed = state.entries.remove(idx).unwrap();
            state.size_bytes -= removed.size_bytes;
            true
        } else {
            false
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.size_bytes = 0;
    }

    pub fn stats(&self) -> L1Stats {
        let state = self.state.lock().unwrap();
        let lookups = state.hits + state.misses;
        let hit_rate = if lookups > 0 {
            state.hits as f64 / lookups as f64
        } else {
            0.0
        };
        let utilization = if self.max_bytes > 0 {
            state.size_bytes as f64 / self.max_bytes as f64
        } else {
            0.0
        };

        L1Stats {
            cache_type: "l1".to_string(),
            size_bytes: state.size_bytes,
            max_bytes: self.max_bytes,
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            hit_rate,
            utilization,
        }
    }
}

fn entry_size(source: &[u8], chunks: &[Chunk]) -> u64 {
    let chunk_bytes: usize = chunks
        .iter()
        .map(|chunk| chunk.source_code.len() + chunk.qualified_name.len() + 128)
        .sum();
    (source.len() + chunk_bytes) as u64
}
