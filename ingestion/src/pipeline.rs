use crate::chunker::{self, ChunkOutline};
use crate::extract::{ExtractedFacts, ExtractionContext, ExtractorRegistry};
use crate::language::{detect_language, is_probably_binary, MAX_FILE_BYTES};
use crate::oracle::{parse_hover_signature, OracleClient};
use crate::parser;
use mnemolite_cache::CascadeCache;
use mnemolite_core::config::PipelineConfig;
use mnemolite_core::embedding::{Embedder, EmbeddingDomain};
use mnemolite_core::error::ErrorKind;
use mnemolite_core::events::{CoreEvent, EventKind, EventSink};
use mnemolite_core::fingerprint::Fingerprint;
use mnemolite_core::model::{now_rfc3339, Chunk, ChunkKind, ChunkMetadata, Complexity, Language};
use mnemolite_storage::MetaStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Indexed,
    Cached,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileIndexResult {
    pub repository: String,
    pub file_path: String,
    pub status: FileStatus,
    pub chunks: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

impl FileIndexResult {
    fn new(repository: &str, file_path: &str, status: FileStatus) -> Self {
        Self {
            repository: repository.to_string(),
            file_path: file_path.to_string(),
            status,
            chunks: 0,
            error_kind: None,
            message: None,
            warnings: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn skipped(repository: &str, file_path: &str, kind: ErrorKind, message: &str) -> Self {
        let mut result = Self::new(repository, file_path, FileStatus::Skipped);
        result.error_kind = Some(kind);
        result.message = Some(message.to_string());
        result
    }

    pub fn failed(repository: &str, file_path: &str, kind: ErrorKind, message: String) -> Self {
        let mut result = Self::new(repository, file_path, FileStatus::Failed);
        result.error_kind = Some(kind);
        result.message = Some(message);
        result
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, FileStatus::Indexed | FileStatus::Cached)
    }
}

/// Per-file indexing state machine:
/// stale-invalidate → detect → cache probe → parse → chunk → extract
/// (+ oracle) → embed → persist atomically → write-through.
pub struct IndexingPipeline {
    store: Arc<MetaStore>,
    cascade: Arc<CascadeCache>,
    embedder: Arc<dyn Embedder>,
    extractors: Arc<ExtractorRegistry>,
    oracle: Arc<OracleClient>,
    events: Arc<dyn EventSink>,
    config: PipelineConfig,
}

impl IndexingPipeline {
    pub fn new(
        store: Arc<MetaStore>,
        cascade: Arc<CascadeCache>,
        embedder: Arc<dyn Embedder>,
        extractors: Arc<ExtractorRegistry>,
        oracle: Arc<OracleClient>,
        events: Arc<dyn EventSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            cascade,
            embedder,
            extractors,
            oracle,
            events,
            config,
        }
    }

    pub fn cascade(&self) -> &Arc<CascadeCache> {
        &self.cascade
    }

    pub async fn index_file(
        &self,
        repository: &str,
        file_path: &str,
        source: &[u8],
        trace_id: &str,
    ) -> FileIndexResult {
        let started = Instant::now();
        let _ = self.events.record(
            CoreEvent::new(EventKind::IndexFileStart, trace_id)
                .with_repository(repository)
                .with_file(file_path),
        );

        let file_budget = Duration::from_secs(self.config.file_timeout_s);
        let mut result =
            match tokio::time::timeout(file_budget, self.run(repository, file_path, source, trace_id))
                .await
            {
                Ok(result) => result,
                Err(_) => FileIndexResult::failed(
                    repository,
                    file_path,
                    ErrorKind::Timeout,
                    format!("file processing exceeded {}s", self.config.file_timeout_s),
                ),
            };
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        let completion = match result.status {
            FileStatus::Failed => EventKind::IndexFileFailed,
            _ => EventKind::IndexFileEnd,
        };
        let _ = self.events.record(
            CoreEvent::new(completion, trace_id)
                .with_repository(repository)
                .with_file(file_path)
                .with_detail("chunks", result.chunks.to_string()),
        );

        result
    }

    async fn run(
        &self,
        repository: &str,
        file_path: &str,
        source: &[u8],
        trace_id: &str,
    ) -> FileIndexResult {
        // S0: an in-flight re-index must never serve a stale version.
        self.cascade.invalidate_stale(file_path, source);

        // S1: policy skips and language detection.
        if source.len() > MAX_FILE_BYTES {
            return FileIndexResult::skipped(
                repository,
                file_path,
                ErrorKind::SkippedFile,
                "file exceeds size cap",
            );
        }
        if is_probably_binary(source) {
            return FileIndexResult::skipped(
                repository,
                file_path,
                ErrorKind::SkippedFile,
                "binary content",
            );
        }
        let Some(language) = detect_language(file_path) else {
            return FileIndexResult::skipped(
                repository,
                file_path,
                ErrorKind::UnknownLanguage,
                "no parser registered for this extension",
            );
        };
        let Ok(text) = std::str::from_utf8(source) else {
            return FileIndexResult::skipped(
                repository,
                file_path,
                ErrorKind::SkippedFile,
                "not valid UTF-8",
            );
        };

        // S2: fingerprint-validated cache probe. A hit returns the cached
        // chunks as-is; they already exist in the store. Cache keys carry
        // no repository, so a same-path same-content file from another
        // repository must fall through to a real index.
        if let Some(chunks) = self.cascade.get_chunks(file_path, source).await {
            let same_repository = chunks
                .first()
                .map(|chunk| chunk.repository == repository)
                .unwrap_or(true);
            if same_repository {
                let _ = self.events.record(
                    CoreEvent::new(EventKind::CacheHit, trace_id)
                        .with_repository(repository)
                        .with_file(file_path),
                );
                let mut result = FileIndexResult::new(repository, file_path, FileStatus::Cached);
                result.chunks = chunks.len();
                return result;
            }
        }
        let _ = self.events.record(
            CoreEvent::new(EventKind::CacheMiss, trace_id)
                .with_repository(repository)
                .with_file(file_path),
        );

        // S3: parse, bounded. Parsing is CPU-bound and runs off the
        // coordinator thread.
        let parse_budget = Duration::from_secs(self.config.parse_timeout_s);
        let owned = text.to_string();
        let parsed = tokio::time::timeout(
            parse_budget,
            tokio::task::spawn_blocking(move || {
                parser::parse(language, &owned).map(|tree| (tree, owned))
            }),
        )
        .await;

        let (tree, text) = match parsed {
            Err(_) => {
                return FileIndexResult::failed(
                    repository,
                    file_path,
                    ErrorKind::ParseError,
                    format!("parse exceeded {}s", self.config.parse_timeout_s),
                )
            }
            Ok(Err(join_err)) => {
                return FileIndexResult::failed(
                    repository,
                    file_path,
                    ErrorKind::ParseError,
                    format!("parser task failed: {join_err}"),
                )
            }
            Ok(Ok(Err(parse_err))) => {
                return FileIndexResult::failed(
                    repository,
                    file_path,
                    ErrorKind::ParseError,
                    parse_err.to_string(),
                )
            }
            Ok(Ok(Ok(pair))) => pair,
        };

        // S4: structural chunking with fixed-size fallback.
        let outlines = chunker::chunk_source(language, file_path, &text, &tree);
        debug!(%file_path, count = outlines.len(), "chunked file");

        // S5: best-effort metadata per chunk, synchronously while the tree
        // is alive; type enrichment happens afterwards via the oracle.
        let extractor = self.extractors.resolve(language);
        let module_refs = extractor
            .as_ref()
            .map(|e| e.module_references(&text, &tree))
            .unwrap_or_default();

        let mut facts: Vec<ExtractedFacts> = Vec::with_capacity(outlines.len());
        for outline in &outlines {
            let extracted = extractor
                .as_ref()
                .and_then(|e| {
                    tree.root_node()
                        .descendant_for_byte_range(outline.start_byte, outline.end_byte)
                        .map(|node| {
                            e.extract(&ExtractionContext {
                                source: &text,
                                node,
                                tree: &tree,
                                language,
                                module_imports: &module_refs.imports,
                                module_re_exports: &module_refs.re_exports,
                            })
                        })
                })
                .unwrap_or_else(|| {
                    warn!(%file_path, chunk = %outline.qualified_name, "extraction degraded to basic record");
                    ExtractedFacts::default()
                });
            facts.push(extracted);
        }
        drop(tree);

        let mut chunks = match assemble_chunks(repository, file_path, language, &text, &outlines, facts) {
            Ok(chunks) => chunks,
            Err(message) => {
                return FileIndexResult::failed(
                    repository,
                    file_path,
                    ErrorKind::ChunkingError,
                    message,
                )
            }
        };

        // S5b: oracle type enrichment, bounded per chunk by the client.
        for chunk in &mut chunks {
            if !matches!(chunk.kind, ChunkKind::Function | ChunkKind::Method) {
                continue;
            }
            if let Some(hover) = self.oracle.hover(file_path, chunk.start_line, 0).await {
                let (param_types, return_type) = parse_hover_signature(&hover);
                chunk.metadata.param_types = param_types;
                chunk.metadata.return_type = return_type;
            }
        }

        // S6: embeddings, batched per domain. Failure is non-fatal: the
        // chunk persists without vectors and stays lexically searchable.
        let mut warnings = Vec::new();
        if !chunks.is_empty() {
            let embed_budget = Duration::from_secs(self.config.embed_timeout_s);

            let text_inputs: Vec<String> = chunks.iter().map(embedding_text).collect();
            match tokio::time::timeout(
                embed_budget,
                self.embedder.embed(EmbeddingDomain::Text, &text_inputs),
            )
            .await
            {
                Ok(Ok(vectors)) if vectors.len() == chunks.len() => {
                    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                        chunk.embedding_text = Some(vector);
                    }
                }
                _ => warnings.push("embedding_error: text vectors unavailable".to_string()),
            }

            let code_inputs: Vec<String> =
                chunks.iter().map(|chunk| chunk.source_code.clone()).collect();
            match tokio::time::timeout(
                embed_budget,
                self.embedder.embed(EmbeddingDomain::Code, &code_inputs),
            )
            .await
            {
                Ok(Ok(vectors)) if vectors.len() == chunks.len() => {
                    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                        chunk.embedding_code = Some(vector);
                    }
                }
                _ => warnings.push("embedding_error: code vectors unavailable".to_string()),
            }
        }

        // S7: atomic per-file replacement in one transaction. The write
        // runs as its own task so a timeout never tears a transaction in
        // half between log commit and table apply.
        let persist_budget = Duration::from_secs(self.config.persist_timeout_s);
        let persist = {
            let store = self.store.clone();
            let repository = repository.to_string();
            let file_path = file_path.to_string();
            let chunks = chunks.clone();
            tokio::spawn(async move {
                store
                    .replace_file_chunks(&repository, &file_path, chunks)
                    .await
            })
        };
        match tokio::time::timeout(persist_budget, persist).await {
            Err(_) => {
                return FileIndexResult::failed(
                    repository,
                    file_path,
                    ErrorKind::PersistError,
                    format!("persist exceeded {}s", self.config.persist_timeout_s),
                )
            }
            Ok(Err(join_err)) => {
                return FileIndexResult::failed(
                    repository,
                    file_path,
                    ErrorKind::PersistError,
                    format!("persist task failed: {join_err}"),
                )
            }
            Ok(Ok(Err(err))) => {
                // Rolled back; nothing was cached, so retry is safe.
                return FileIndexResult::failed(
                    repository,
                    file_path,
                    ErrorKind::PersistError,
                    err.to_string(),
                );
            }
            Ok(Ok(Ok(()))) => {}
        }

        // S8: write-through after the commit.
        self.cascade.put_chunks(file_path, source, &chunks).await;

        let mut result = FileIndexResult::new(repository, file_path, FileStatus::Indexed);
        result.chunks = chunks.len();
        result.warnings = warnings;
        result
    }
}

fn assemble_chunks(
    repository: &str,
    file_path: &str,
    language: Language,
    text: &str,
    outlines: &[ChunkOutline],
    facts: Vec<ExtractedFacts>,
) -> Result<Vec<Chunk>, String> {
    let now = now_rfc3339();
    let mut chunks = Vec::with_capacity(outlines.len());

    for (outline, facts) in outlines.iter().zip(facts) {
        let Some(source_code) = text.get(outline.start_byte..outline.end_byte) else {
            return Err(format!(
                "chunk {} spans invalid byte range {}..{}",
                outline.qualified_name, outline.start_byte, outline.end_byte
            ));
        };

        let metadata = ChunkMetadata {
            content_hash: Fingerprint::of(source_code.as_bytes()),
            signature: facts.signature,
            return_type: None,
            param_types: Vec::new(),
            imports: facts.imports,
            re_exports: facts.re_exports,
            calls: facts.calls,
            complexity: Complexity {
                cyclomatic: facts.cyclomatic,
                lines_of_code: outline.end_line - outline.start_line + 1,
            },
            docstring: facts.docstring,
            extra: Default::default(),
        };

        chunks.push(Chunk {
            chunk_id: Chunk::identity_id(
                repository,
                file_path,
                language,
                outline.kind,
                &outline.qualified_name,
            ),
            repository: repository.to_string(),
            file_path: file_path.to_string(),
            language,
            kind: outline.kind,
            name: outline.name.clone(),
            qualified_name: outline.qualified_name.clone(),
            start_line: outline.start_line,
            end_line: outline.end_line,
            source_code: source_code.to_string(),
            metadata,
            embedding_text: None,
            embedding_code: None,
            created_at: now.clone(),
            updated_at: now.clone(),
        });
    }

    Ok(chunks)
}

/// Natural-language representation fed to the TEXT embedding domain.
fn embedding_text(chunk: &Chunk) -> String {
    let mut parts = vec![chunk.qualified_name.clone()];
    if let Some(signature) = &chunk.metadata.signature {
        parts.push(signature.clone());
    }
    if let Some(docstring) = &chunk.metadata.docstring {
        parts.push(docstring.clone());
    }
    parts.join(" ")
}
