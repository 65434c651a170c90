use mnemolite_cache::{CascadeCache, ChunkCache, MemoryCache, SharedCache};
use mnemolite_core::config::{AppConfig, OracleConfig};
use mnemolite_core::embedding::DeterministicEmbedder;
use mnemolite_core::error::ErrorKind;
use mnemolite_core::events::InMemoryEventSink;
use mnemolite_ingestion::extract::ExtractorRegistry;
use mnemolite_ingestion::{FileStatus, IndexingPipeline, OracleClient, StaticOracle};
use mnemolite_storage::MetaStore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct Harness {
    pipeline: IndexingPipeline,
    store: Arc<MetaStore>,
    embedder: Arc<DeterministicEmbedder>,
    l2: Arc<MemoryCache>,
    events: Arc<InMemoryEventSink>,
}

async fn harness(dir: &Path, oracle: OracleClient) -> Harness {
    harness_with_config(dir, oracle, AppConfig::default()).await
}

async fn harness_with_config(dir: &Path, oracle: OracleClient, config: AppConfig) -> Harness {
    let store = Arc::new(MetaStore::open(dir.join("meta.txlog")).await.unwrap());
    let l1 = Arc::new(ChunkCache::new(config.l1.max_bytes));
    let l2 = Arc::new(MemoryCache::new());
    let cascade = Arc::new(CascadeCache::new(
        l1,
        l2.clone(),
        Duration::from_secs(config.l2.ttl_chunks_s),
    ));
    let embedder = Arc::new(DeterministicEmbedder::new(64));
    let events = Arc::new(InMemoryEventSink::default());

    let pipeline = IndexingPipeline::new(
        store.clone(),
        cascade,
        embedder.clone(),
        Arc::new(ExtractorRegistry::with_defaults()),
        Arc::new(oracle),
        events.clone(),
        config.pipeline,
    );

    Harness {
        pipeline,
        store,
        embedder,
        l2,
        events,
    }
}

const TS_SOURCE: &str = r#"
export class MathService {
    multiply(a: number, b: number): number {
        return a * b;
    }
}

export function helper(): number {
    return 1;
}
"#;

#[tokio::test]
async fn test_index_file_persists_chunks_and_writes_through() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), OracleClient::disabled()).await;

    let result = h
        .pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-1")
        .await;

    assert_eq!(result.status, FileStatus::Indexed);
    assert_eq!(result.chunks, 3); // class + method + function

    let stored = h.store.chunks_for_file("repo", "src/math.ts").await;
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|c| c.embedding_text.is_some()));
    assert!(stored.iter().all(|c| c.embedding_code.is_some()));
    assert!(stored
        .iter()
        .any(|c| c.qualified_name == "math.MathService.multiply"));

    // S8 write-through: the next read must hit the cascade.
    let cached = h
        .pipeline
        .cascade()
        .get_chunks("src/math.ts", TS_SOURCE.as_bytes())
        .await;
    assert!(cached.is_some());
}

#[tokio::test]
async fn test_reindex_of_unchanged_file_is_served_from_cache() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), OracleClient::disabled()).await;

    let first = h
        .pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-1")
        .await;
    assert_eq!(first.status, FileStatus::Indexed);

    let second = h
        .pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-2")
        .await;
    assert_eq!(second.status, FileStatus::Cached);
    assert_eq!(second.chunks, first.chunks);

    // The hit must come from L1, not a re-parse.
    assert!(h.pipeline.cascade().stats().l1.hits >= 1);
}

#[tokio::test]
async fn test_modified_file_misses_cache_and_reindexes() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), OracleClient::disabled()).await;

    h.pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-1")
        .await;

    let modified = TS_SOURCE.replace("return a * b;", "return b * a;");
    let result = h
        .pipeline
        .index_file("repo", "src/math.ts", modified.as_bytes(), "trace-2")
        .await;

    assert_eq!(result.status, FileStatus::Indexed);
    let stored = h.store.chunks_for_file("repo", "src/math.ts").await;
    assert!(stored
        .iter()
        .any(|c| c.source_code.contains("return b * a;")));
}

#[tokio::test]
async fn test_unknown_language_and_binary_files_are_skipped() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), OracleClient::disabled()).await;

    let unknown = h
        .pipeline
        .index_file("repo", "README.md", b"# readme", "trace-1")
        .await;
    assert_eq!(unknown.status, FileStatus::Skipped);
    assert_eq!(unknown.error_kind, Some(ErrorKind::UnknownLanguage));

    let binary = h
        .pipeline
        .index_file("repo", "blob.ts", b"\x00\x01\x02\x03", "trace-2")
        .await;
    assert_eq!(binary.status, FileStatus::Skipped);
    assert_eq!(binary.error_kind, Some(ErrorKind::SkippedFile));
}

#[tokio::test]
async fn test_parse_error_fails_without_partial_persist() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), OracleClient::disabled()).await;

    let result = h
        .pipeline
        .index_file("repo", "broken.py", b"def broken(:\n  ]]]\n", "trace-1")
        .await;

    assert_eq!(result.status, FileStatus::Failed);
    assert_eq!(result.error_kind, Some(ErrorKind::ParseError));
    assert!(h.store.chunks_for_file("repo", "broken.py").await.is_empty());

    // No cache write on failure either.
    let cached = h
        .pipeline
        .cascade()
        .get_chunks("broken.py", b"def broken(:\n  ]]]\n")
        .await;
    assert!(cached.is_none());
}

#[tokio::test]
async fn test_embedding_failure_is_nonfatal_and_chunks_stay_searchable() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), OracleClient::disabled()).await;
    h.embedder.set_failing(true);

    let result = h
        .pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-1")
        .await;

    assert_eq!(result.status, FileStatus::Indexed);
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("embedding_error")));

    let stored = h.store.chunks_for_file("repo", "src/math.ts").await;
    assert_eq!(stored.len(), 3);
    assert!(stored.iter().all(|c| c.embedding_text.is_none()));
    assert!(stored.iter().all(|c| c.embedding_code.is_none()));

    // Lexical access still works over the persisted rows.
    let lexical = h
        .store
        .chunks_where(|c| c.source_code.contains("multiply"))
        .await;
    assert!(!lexical.is_empty());
}

#[tokio::test]
async fn test_l2_outage_degrades_but_pipeline_completes() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), OracleClient::disabled()).await;
    h.l2.set_connected(false);

    let result = h
        .pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-1")
        .await;

    assert_eq!(result.status, FileStatus::Indexed);
    assert_eq!(h.store.chunks_for_file("repo", "src/math.ts").await.len(), 3);
    assert!(h.l2.stats().failures > 0);
}

#[tokio::test]
async fn test_oracle_enrichment_fills_type_fields() {
    let dir = tempdir().unwrap();
    let oracle_config = OracleConfig {
        enabled: true,
        timeout_s: 3,
    };
    // The method starts on line 3 of the test source.
    let oracle = OracleClient::new(&oracle_config, || {
        Arc::new(
            StaticOracle::new()
                .with_hover("src/math.ts", 3, "(a: number, b: number) => number"),
        )
    });
    let h = harness(dir.path(), oracle).await;

    h.pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-1")
        .await;

    let stored = h.store.chunks_for_file("repo", "src/math.ts").await;
    let method = stored
        .iter()
        .find(|c| c.qualified_name == "math.MathService.multiply")
        .unwrap();
    assert_eq!(method.metadata.return_type.as_deref(), Some("number"));
    assert_eq!(method.metadata.param_types.len(), 2);
}

#[tokio::test]
async fn test_disabled_oracle_leaves_type_fields_empty() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), OracleClient::disabled()).await;

    h.pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-1")
        .await;

    let stored = h.store.chunks_for_file("repo", "src/math.ts").await;
    // Typed source, no oracle: metadata exists but type fields stay empty.
    assert!(stored.iter().all(|c| c.metadata.return_type.is_none()));
    assert!(stored.iter().all(|c| c.metadata.param_types.is_empty()));
    assert!(stored.iter().all(|c| c.metadata.complexity.cyclomatic.is_some()));
}

#[tokio::test]
async fn test_parse_timeout_fails_without_committing_chunks() {
    let dir = tempdir().unwrap();
    let mut config = AppConfig::default();
    // A zero budget elapses before the parser task can report back.
    config.pipeline.parse_timeout_s = 0;
    let h = harness_with_config(dir.path(), OracleClient::disabled(), config).await;

    let result = h
        .pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-1")
        .await;

    assert_eq!(result.status, FileStatus::Failed);
    assert_eq!(result.error_kind, Some(ErrorKind::ParseError));
    assert!(h.store.chunks_for_file("repo", "src/math.ts").await.is_empty());
}

#[tokio::test]
async fn test_events_carry_the_trace_id() {
    let dir = tempdir().unwrap();
    let h = harness(dir.path(), OracleClient::disabled()).await;

    h.pipeline
        .index_file("repo", "src/math.ts", TS_SOURCE.as_bytes(), "trace-events")
        .await;

    let events = h.events.events().unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.trace_id == "trace-events"));
}
