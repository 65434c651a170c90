use mnemolite_core::embedding::EmbeddingDomain;
use mnemolite_core::model::{Chunk, ChunkKind};
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

/// Both embedding domains of a repository's chunks in one structure.
///
/// Vectors are L2-normalized on the way in, so similarity at query time
/// is a plain dot product over unit vectors. The dimension is pinned by
/// the first vector accepted — it is fixed per deployment — and any
/// vector of a different width is dropped with a warning instead of
/// poisoning comparisons. Entries carry the chunk kind so searches can
/// discard whole kinds before any arithmetic or chunk lookup happens.
pub struct EmbeddingIndex {
    dimension: Option<usize>,
    entries: HashMap<Uuid, IndexedChunk>,
}

struct IndexedChunk {
    kind: ChunkKind,
    text: Option<Vec<f32>>,
    code: Option<Vec<f32>>,
}

impl IndexedChunk {
    fn vector(&self, domain: EmbeddingDomain) -> Option<&Vec<f32>> {
        match domain {
            EmbeddingDomain::Text => self.text.as_ref(),
            EmbeddingDomain::Code => self.code.as_ref(),
        }
    }
}

impl EmbeddingIndex {
    pub fn new() -> Self {
        Self {
            dimension: None,
            entries: HashMap::new(),
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// (Re)index a chunk's vectors. A chunk with no usable vector in
    /// either domain holds no entry at all — it stays lexically
    /// searchable through the chunk tables, just not vectorially.
    pub fn index_chunk(&mut self, chunk: &Chunk) {
        let text = chunk
            .embedding_text
            .as_deref()
            .and_then(|vector| self.admit(chunk, EmbeddingDomain::Text, vector));
        let code = chunk
            .embedding_code
            .as_deref()
            .and_then(|vector| self.admit(chunk, EmbeddingDomain::Code, vector));

        if text.is_none() && code.is_none() {
            self.entries.remove(&chunk.chunk_id);
            return;
        }

        self.entries.insert(
            chunk.chunk_id,
            IndexedChunk {
                kind: chunk.kind,
                text,
                code,
            },
        );
    }

    pub fn remove(&mut self, chunk_id: &Uuid) -> bool {
        self.entries.remove(chunk_id).is_some()
    }

    /// Top-k by cosine (dot product over unit vectors) in one domain.
    /// `kind` discards non-matching kinds before the `accept` callback or
    /// any scoring runs; ties break on chunk id for stable output.
    pub fn search(
        &self,
        domain: EmbeddingDomain,
        query: &[f32],
        k: usize,
        kind: Option<ChunkKind>,
        mut accept: impl FnMut(&Uuid) -> bool,
    ) -> Vec<(Uuid, f32)> {
        let Some(query) = self.unit_query(query) else {
            return Vec::new();
        };

        let mut hits: Vec<(Uuid, f32)> = Vec::new();
        for (chunk_id, entry) in &self.entries {
            if kind.is_some_and(|wanted| entry.kind != wanted) {
                continue;
            }
            let Some(vector) = entry.vector(domain) else {
                continue;
            };
            if !accept(chunk_id) {
                continue;
            }
            let score: f32 = query.iter().zip(vector).map(|(q, v)| q * v).sum();
            hits.push((*chunk_id, score));
        }

        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        hits.truncate(k);
        hits
    }

    pub fn len(&self, domain: EmbeddingDomain) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.vector(domain).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dimension-check and normalize an incoming vector; the first
    /// accepted vector pins the index dimension.
    fn admit(
        &mut self,
        chunk: &Chunk,
        domain: EmbeddingDomain,
        vector: &[f32],
    ) -> Option<Vec<f32>> {
        if vector.is_empty() {
            return None;
        }
        match self.dimension {
            Some(dimension) if dimension != vector.len() => {
                warn!(
                    chunk = %chunk.qualified_name,
                    domain = domain.as_str(),
                    expected = dimension,
                    got = vector.len(),
                    "embedding dimension mismatch; vector dropped"
                );
                return None;
            }
            None => self.dimension = Some(vector.len()),
            _ => {}
        }
        unit(vector)
    }

    fn unit_query(&self, query: &[f32]) -> Option<Vec<f32>> {
        if self.dimension.is_some_and(|dimension| dimension != query.len()) {
            return None;
        }
        unit(query)
    }
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn unit(vector: &[f32]) -> Option<Vec<f32>> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return None;
    }
    Some(vector.iter().map(|x| x / norm).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemolite_core::fingerprint::Fingerprint;
    use mnemolite_core::model::{now_rfc3339, ChunkMetadata, Language};

    fn chunk(
        name: &str,
        kind: ChunkKind,
        text: Option<Vec<f32>>,
        code: Option<Vec<f32>>,
    ) -> Chunk {
        let qualified = format!("mod.{name}");
        Chunk {
            chunk_id: Chunk::identity_id("repo", "mod.py", Language::Python, kind, &qualified),
            repository: "repo".to_string(),
            file_path: "mod.py".to_string(),
            language: Language::Python,
            kind,
            name: name.to_string(),
            qualified_name: qualified,
            start_line: 1,
            end_line: 2,
            source_code: String::new(),
            metadata: ChunkMetadata::basic(Fingerprint::of(name.as_bytes()), 2),
            embedding_text: text,
            embedding_code: code,
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        }
    }

    #[test]
    fn domains_are_searched_independently() {
        let mut index = EmbeddingIndex::new();
        index.index_chunk(&chunk(
            "f",
            ChunkKind::Function,
            Some(vec![1.0, 0.0]),
            Some(vec![0.0, 1.0]),
        ));

        let text_hits = index.search(EmbeddingDomain::Text, &[1.0, 0.0], 5, None, |_| true);
        let code_hits = index.search(EmbeddingDomain::Code, &[1.0, 0.0], 5, None, |_| true);

        assert!((text_hits[0].1 - 1.0).abs() < 1e-6);
        assert!(code_hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn nearest_direction_wins_regardless_of_magnitude() {
        let mut index = EmbeddingIndex::new();
        // Same direction as the query but tiny magnitude…
        index.index_chunk(&chunk(
            "aligned",
            ChunkKind::Function,
            Some(vec![0.001, 0.0]),
            None,
        ));
        // …beats a large orthogonal-ish vector.
        index.index_chunk(&chunk(
            "skewed",
            ChunkKind::Function,
            Some(vec![100.0, 300.0]),
            None,
        ));

        let hits = index.search(EmbeddingDomain::Text, &[1.0, 0.0], 2, None, |_| true);
        assert_eq!(hits.len(), 2);
        let top = &hits[0];
        assert!((top.1 - 1.0).abs() < 1e-6);
    }

    #[test]
    fn kind_prefilter_skips_other_kinds() {
        let mut index = EmbeddingIndex::new();
        index.index_chunk(&chunk(
            "f",
            ChunkKind::Function,
            Some(vec![1.0, 0.0]),
            None,
        ));
        index.index_chunk(&chunk(
            "C",
            ChunkKind::Class,
            Some(vec![1.0, 0.0]),
            None,
        ));

        let mut accepted = 0;
        let hits = index.search(
            EmbeddingDomain::Text,
            &[1.0, 0.0],
            5,
            Some(ChunkKind::Class),
            |_| {
                accepted += 1;
                true
            },
        );

        assert_eq!(hits.len(), 1);
        // The function entry was discarded before the accept callback.
        assert_eq!(accepted, 1);
    }

    #[test]
    fn first_vector_pins_the_dimension() {
        let mut index = EmbeddingIndex::new();
        index.index_chunk(&chunk(
            "good",
            ChunkKind::Function,
            Some(vec![1.0, 0.0, 0.0]),
            None,
        ));
        assert_eq!(index.dimension(), Some(3));

        // A two-wide vector is dropped, leaving the chunk unindexed.
        index.index_chunk(&chunk(
            "narrow",
            ChunkKind::Function,
            Some(vec![1.0, 0.0]),
            None,
        ));
        assert_eq!(index.len(EmbeddingDomain::Text), 1);

        // A query of the wrong width cannot match anything either.
        assert!(index
            .search(EmbeddingDomain::Text, &[1.0, 0.0], 5, None, |_| true)
            .is_empty());
    }

    #[test]
    fn zero_vectors_are_not_indexed() {
        let mut index = EmbeddingIndex::new();
        index.index_chunk(&chunk(
            "null",
            ChunkKind::Function,
            Some(vec![0.0, 0.0]),
            None,
        ));
        assert!(index.is_empty());
    }

    #[test]
    fn reindex_replaces_and_remove_deletes() {
        let mut index = EmbeddingIndex::new();
        let first = chunk("f", ChunkKind::Function, Some(vec![1.0, 0.0]), None);
        index.index_chunk(&first);
        index.index_chunk(&chunk(
            "f",
            ChunkKind::Function,
            Some(vec![0.0, 1.0]),
            None,
        ));

        let hits = index.search(EmbeddingDomain::Text, &[0.0, 1.0], 1, None, |_| true);
        assert!((hits[0].1 - 1.0).abs() < 1e-6);

        assert!(index.remove(&first.chunk_id));
        assert!(!index.remove(&first.chunk_id));
        assert!(index.is_empty());
    }
}
