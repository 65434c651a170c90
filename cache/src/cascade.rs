use crate::l1::{ChunkCache, L1Stats};
use crate::l2::{L2Stats, SharedCache};
use mnemolite_core::fingerprint::Fingerprint;
use mnemolite_core::model::Chunk;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct CascadeStats {
    pub l1: L1Stats,
    pub l2: L2Stats,
    /// `H = H_L1 + (1 − H_L1) · H_L2` over per-layer rates since boot.
    pub combined_hit_rate: f64,
}

/// Orchestrates L1 and L2: write-through on insert, read-through with
/// L2→L1 promotion on hit, fan-out invalidation on file change.
pub struct CascadeCache {
    l1: Arc<ChunkCache>,
    l2: Arc<dyn SharedCache>,
    chunk_ttl: Duration,
}

fn chunk_key(file_path: &str, fingerprint: &Fingerprint) -> String {
    format!("chunks:{}:{}", file_path, fingerprint)
}

impl CascadeCache {
    pub fn new(l1: Arc<ChunkCache>, l2: Arc<dyn SharedCache>, chunk_ttl: Duration) -> Self {
        Self { l1, l2, chunk_ttl }
    }

    pub fn l1(&self) -> &Arc<ChunkCache> {
        &self.l1
    }

    pub fn l2(&self) -> &Arc<dyn SharedCache> {
        &self.l2
    }

    pub async fn get_chunks(&self, file_path: &str, source: &[u8]) -> Option<Vec<Chunk>> {
        if let Some(chunks) = self.l1.get(file_path, source) {
            return Some(chunks);
        }

        let fingerprint = Fingerprint::of(source);
        let key = chunk_key(file_path, &fingerprint);
        let bytes = self.l2.get(&key).await?;

        match serde_json::from_slice::<Vec<Chunk>>(&bytes) {
            Ok(chunks) => {
                // Promotion: the L2 hit must be visible in L1 before we
                // return, so the next read stays in-process.
                self.l1.put(file_path, source, chunks.clone());
                Some(chunks)
            }
            Err(err) => {
                warn!(%key, error = %err, "dropping undecodable shared-cache entry");
                self.l2.delete(&key).await;
                None
            }
        }
    }

    pub async fn put_chunks(&self, file_path: &str, source: &[u8], chunks: &[Chunk]) {
        self.l1.put(file_path, source, chunks.to_vec());

        let fingerprint = Fingerprint::of(source);
        let key = chunk_key(file_path, &fingerprint);
        match serde_json::to_vec(chunks) {
            // Write-through is best-effort: an L2 failure never fails the call.
            Ok(bytes) => {
                self.l2.set(&key, bytes, self.chunk_ttl).await;
            }
            Err(err) => {
                warn!(%key, error = %err, "failed to encode chunks for shared cache");
            }
        }
    }

    /// Stale-version invalidation at the head of a re-index. L1 drops the
    /// entry only on fingerprint mismatch; L2 entries for old fingerprints
    /// live under keys that can no longer be read and fall to their TTL.
    pub fn invalidate_stale(&self, file_path: &str, source: &[u8]) {
        let fingerprint = Fingerprint::of(source);
        self.l1.evict_if_stale(file_path, &fingerprint);
    }

    pub async fn invalidate(&self, file_path: &str) {
        self.l1.invalidate(file_path);
        self.l2
            .delete_pattern(&format!("chunks:{}:*", file_path))
            .await;
    }

    /// Repository-wide invalidation. L1 keeps no repository index, so it is
    /// cleared wholesale; L2 entries fall to a path-prefix pattern delete.
    pub async fn invalidate_repository(&self, path_prefix: &str) {
        self.l1.clear();
        self.l2
            .delete_pattern(&format!("chunks:{}*", path_prefix))
            .await;
    }

    pub fn stats(&self) -> CascadeStats {
        let l1 = self.l1.stats();
        let l2 = self.l2.stats();
        let combined_hit_rate = l1.hit_rate + (1.0 - l1.hit_rate) * l2.hit_rate;
        CascadeStats {
            l1,
            l2,
            combined_hit_rate,
        }
    }
}
