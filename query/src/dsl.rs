use mnemolite_core::fingerprint::Fingerprint;
use mnemolite_core::model::{Chunk, ChunkKind, Language};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SearchFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<Language>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ChunkKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    /// Glob over file paths, e.g. `src/**/*.ts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Substring match on the extracted return type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    /// Substring match on any parameter type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub param_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchWeights {
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f32,
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f32,
    #[serde(default = "default_true")]
    pub enable_lexical: bool,
    #[serde(default = "default_true")]
    pub enable_vector: bool,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            lexical_weight: default_lexical_weight(),
            vector_weight: default_vector_weight(),
            enable_lexical: true,
            enable_vector: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFlags {
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl Default for SearchFlags {
    fn default() -> Self {
        Self { cache: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub filters: SearchFilters,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default)]
    pub weights: SearchWeights,
    #[serde(default)]
    pub flags: SearchFlags,
}

const fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_lexical_weight() -> f32 {
    0.4
}

fn default_vector_weight() -> f32 {
    0.6
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SearchValidationError {
    #[error("query must not be empty")]
    EmptyQuery,
    #[error("pagination.limit must be between 1 and {0}")]
    InvalidLimit(usize),
    #[error("weights must not be negative")]
    NegativeWeight,
    #[error("at least one of lexical or vector search must be enabled")]
    NothingEnabled,
    #[error("filters.file_path is not a valid glob: {0}")]
    InvalidGlob(String),
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            filters: SearchFilters::default(),
            pagination: Pagination::default(),
            weights: SearchWeights::default(),
            flags: SearchFlags::default(),
        }
    }

    pub fn parse_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), SearchValidationError> {
        if self.query.trim().is_empty() {
            return Err(SearchValidationError::EmptyQuery);
        }
        if self.pagination.limit == 0 || self.pagination.limit > MAX_LIMIT {
            return Err(SearchValidationError::InvalidLimit(MAX_LIMIT));
        }
        if self.weights.lexical_weight < 0.0 || self.weights.vector_weight < 0.0 {
            return Err(SearchValidationError::NegativeWeight);
        }
        if !self.weights.enable_lexical && !self.weights.enable_vector {
            return Err(SearchValidationError::NothingEnabled);
        }
        if let Some(pattern) = &self.filters.file_path {
            glob::Pattern::new(pattern)
                .map_err(|err| SearchValidationError::InvalidGlob(err.to_string()))?;
        }
        Ok(())
    }

    /// Cache identity of this query: canonical JSON over query text,
    /// filters, weights and flags. Pagination is excluded — the cache
    /// holds the full fused list and pagination slices per request.
    pub fn cache_fingerprint(&self) -> Fingerprint {
        let value = serde_json::json!({
            "query": self.query,
            "filters": self.filters,
            "weights": self.weights,
            "flags": self.flags,
        });
        Fingerprint::of_canonical_json(&value)
    }
}

impl SearchFilters {
    /// Compile into a chunk predicate. Invalid globs were rejected during
    /// validation; a pattern that still fails here matches nothing.
    pub fn matcher(&self) -> impl Fn(&Chunk) -> bool + '_ {
        let glob = self
            .file_path
            .as_deref()
            .map(|pattern| glob::Pattern::new(pattern).ok());

        move |chunk: &Chunk| {
            if let Some(language) = self.language {
                if chunk.language != language {
                    return false;
                }
            }
            if let Some(kind) = self.kind {
                if chunk.kind != kind {
                    return false;
                }
            }
            if let Some(repository) = &self.repository {
                if &chunk.repository != repository {
                    return false;
                }
            }
            match &glob {
                Some(Some(pattern)) => {
                    if !pattern.matches(&chunk.file_path) {
                        return false;
                    }
                }
                Some(None) => return false,
                None => {}
            }
            if let Some(return_type) = &self.return_type {
                let matched = chunk
                    .metadata
                    .return_type
                    .as_deref()
                    .map(|t| t.contains(return_type.as_str()))
                    .unwrap_or(false);
                if !matched {
                    return false;
                }
            }
            if let Some(param_type) = &self.param_type {
                let matched = chunk
                    .metadata
                    .param_types
                    .iter()
                    .any(|(_, t)| t.contains(param_type.as_str()));
                if !matched {
                    return false;
                }
            }
            true
        }
    }
}
