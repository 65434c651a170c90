use crate::dsl::{SearchRequest, SearchValidationError};
use mnemolite_cache::SharedCache;
use mnemolite_core::embedding::{Embedder, EmbeddingDomain};
use mnemolite_core::error::{ErrorKind, KindedError};
use mnemolite_core::model::{Chunk, ChunkKind, Language};
use mnemolite_storage::MetaStore;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Reciprocal-rank fusion constant.
const RRF_K: f32 = 60.0;
/// Per-layer candidate bound before fusion.
const CANDIDATE_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("invalid search request: {0}")]
    InvalidRequest(#[from] SearchValidationError),
}

impl KindedError for SearchError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::InvalidInput
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub chunk_id: Uuid,
    pub repository: String,
    pub file_path: String,
    pub language: Language,
    pub kind: ChunkKind,
    pub name: String,
    pub qualified_name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultItem>,
    pub total: usize,
    pub has_next: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_offset: Option<usize>,
    pub latency_ms: u64,
    pub cache_hit: bool,
    pub lexical_candidates: usize,
    pub vector_candidates: usize,
}

/// The L2-cached payload: the full fused list plus per-layer counts.
/// Pagination happens per request on top of this.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedSearch {
    results: Vec<SearchResultItem>,
    lexical_candidates: usize,
    vector_candidates: usize,
}

/// Hybrid search over persisted chunks: lexical and vector candidate sets
/// fused by reciprocal rank. Results are cached in L2 only; L1 is
/// reserved for chunk caching.
pub struct SearchEngine {
    store: Arc<MetaStore>,
    l2: Arc<dyn SharedCache>,
    embedder: Arc<dyn Embedder>,
    search_ttl: Duration,
}

impl SearchEngine {
    pub fn new(
        store: Arc<MetaStore>,
        l2: Arc<dyn SharedCache>,
        embedder: Arc<dyn Embedder>,
        search_ttl: Duration,
    ) -> Self {
        Self {
            store,
            l2,
            embedder,
            search_ttl,
        }
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, SearchError> {
        let started = Instant::now();
        request.validate()?;

        let key = format!("search:{}", request.cache_fingerprint());

        if request.flags.cache {
            if let Some(bytes) = self.l2.get(&key).await {
                match serde_json::from_slice::<CachedSearch>(&bytes) {
                    Ok(cached) => {
                        debug!(%key, "search served from shared cache");
                        return Ok(paginate(cached, &request, true, started));
                    }
                    Err(err) => {
                        warn!(%key, error = %err, "dropping undecodable search cache entry");
                        self.l2.delete(&key).await;
                    }
                }
            }
        }

        let matcher = request.filters.matcher();

        let lexical = if request.weights.enable_lexical {
            self.lexical_candidates(&request, &matcher).await
        } else {
            Vec::new()
        };

        let vector = if request.weights.enable_vector {
            self.vector_candidates(&request, &matcher).await
        } else {
            Vec::new()
        };

        let fused = fuse(&request, &lexical, &vector, &self.store).await;
        let cached = CachedSearch {
            lexical_candidates: lexical.len(),
            vector_candidates: vector.len(),
            results: fused,
        };

        if request.flags.cache {
            if let Ok(bytes) = serde_json::to_vec(&cached) {
                self.l2.set(&key, bytes, self.search_ttl).await;
            }
        }

        Ok(paginate(cached, &request, false, started))
    }

    /// Bounded substring scan over chunk text and names, ranked by match
    /// density.
    async fn lexical_candidates(
        &self,
        request: &SearchRequest,
        matcher: &(impl Fn(&Chunk) -> bool + Sync),
    ) -> Vec<Chunk> {
        let needle = request.query.to_lowercase();
        let mut hits: Vec<(usize, Chunk)> = self
            .store
            .chunks_where(|chunk| matcher(chunk) && lexical_matches(chunk, &needle))
            .await
            .into_iter()
            .map(|chunk| (occurrences(&chunk, &needle), chunk))
            .collect();

        hits.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| a.1.qualified_name.cmp(&b.1.qualified_name))
        });
        hits.truncate(CANDIDATE_LIMIT);
        hits.into_iter().map(|(_, chunk)| chunk).collect()
    }

    /// Embed the query in the TEXT domain and scan the vector index.
    /// Embedding failure degrades to lexical-only.
    async fn vector_candidates(
        &self,
        request: &SearchRequest,
        matcher: &(impl Fn(&Chunk) -> bool + Sync),
    ) -> Vec<(Uuid, f32)> {
        let embedded = self
            .embedder
            .embed(EmbeddingDomain::Text, &[request.query.clone()])
            .await;

        match embedded {
            Ok(vectors) if !vectors.is_empty() => {
                // The kind filter is pushed into the index so whole kinds
                // are discarded before any scoring.
                self.store
                    .vector_search(
                        EmbeddingDomain::Text,
                        &vectors[0],
                        CANDIDATE_LIMIT,
                        request.filters.kind,
                        matcher,
                    )
                    .await
            }
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "query embedding failed; continuing lexical-only");
                Vec::new()
            }
        }
    }
}

fn lexical_matches(chunk: &Chunk, needle: &str) -> bool {
    chunk.source_code.to_lowercase().contains(needle)
        || chunk.qualified_name.to_lowercase().contains(needle)
        || chunk.name.to_lowercase().contains(needle)
}

fn occurrences(chunk: &Chunk, needle: &str) -> usize {
    chunk.source_code.to_lowercase().matches(needle).count()
        + chunk.qualified_name.to_lowercase().matches(needle).count()
}

/// Reciprocal-rank fusion: `score = Σ_list w_list / (k + rank_in_list)`,
/// deduplicated by chunk id.
async fn fuse(
    request: &SearchRequest,
    lexical: &[Chunk],
    vector: &[(Uuid, f32)],
    store: &Arc<MetaStore>,
) -> Vec<SearchResultItem> {
    let mut scores: HashMap<Uuid, f32> = HashMap::new();
    let mut chunks: HashMap<Uuid, Chunk> = HashMap::new();

    for (rank, chunk) in lexical.iter().enumerate() {
        *scores.entry(chunk.chunk_id).or_default() +=
            request.weights.lexical_weight / (RRF_K + rank as f32 + 1.0);
        chunks.entry(chunk.chunk_id).or_insert_with(|| chunk.clone());
    }

    for (rank, (chunk_id, _similarity)) in vector.iter().enumerate() {
        *scores.entry(*chunk_id).or_default() +=
            request.weights.vector_weight / (RRF_K + rank as f32 + 1.0);
        if !chunks.contains_key(chunk_id) {
            if let Some(chunk) = store.chunk(chunk_id).await {
                chunks.insert(*chunk_id, chunk);
            }
        }
    }

    let mut fused: Vec<SearchResultItem> = scores
        .into_iter()
        .filter_map(|(chunk_id, score)| {
            chunks.get(&chunk_id).map(|chunk| SearchResultItem {
                chunk_id,
                repository: chunk.repository.clone(),
                file_path: chunk.file_path.clone(),
                language: chunk.language,
                kind: chunk.kind,
                name: chunk.name.clone(),
                qualified_name: chunk.qualified_name.clone(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                score,
            })
        })
        .collect();

    fused.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    fused
}

fn paginate(
    cached: CachedSearch,
    request: &SearchRequest,
    cache_hit: bool,
    started: Instant,
) -> SearchResponse {
    let total = cached.results.len();
    let offset = request.pagination.offset.min(total);
    let end = (offset + request.pagination.limit).min(total);
    let has_next = end < total;

    SearchResponse {
        results: cached.results[offset..end].to_vec(),
        total,
        has_next,
        next_offset: has_next.then_some(end),
        latency_ms: started.elapsed().as_millis() as u64,
        cache_hit,
        lexical_candidates: cached.lexical_candidates,
        vector_candidates: cached.vector_candidates,
    }
}
