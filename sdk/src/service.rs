use mnemolite_cache::{CascadeCache, CascadeStats, ChunkCache, MemoryCache, SharedCache};
use mnemolite_core::config::AppConfig;
use mnemolite_core::embedding::{DeterministicEmbedder, Embedder};
use mnemolite_core::events::{new_trace_id, EventSink, TracingEventSink};
use mnemolite_core::model::IndexingStatus;
use mnemolite_ingestion::extract::ExtractorRegistry;
use mnemolite_ingestion::{
    FileIndexResult, GraphBuildReport, GraphConstructor, IndexingPipeline, OracleClient,
    StaticOracle,
};
use mnemolite_jobs::{CoordinatorError, IndexOptions, IndexSummary, WorkCoordinator};
use mnemolite_query::{SearchEngine, SearchError, SearchRequest, SearchResponse};
use mnemolite_storage::{MetaStore, RepositoryStats, StoreError};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Cache-clearing scope for `clear_cache`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    All,
    Repository(String),
    File(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Acknowledgement {
    pub cleared: bool,
    pub scope: String,
}

/// Facade over the indexing and search core: one handle owning the store,
/// the cache tiers, the pipeline, the coordinator and the search engine.
/// Transport adapters (HTTP, tool protocols) call these operations and
/// own nothing else.
pub struct MnemoService {
    store: Arc<MetaStore>,
    l1: Arc<ChunkCache>,
    l2: Arc<dyn SharedCache>,
    cascade: Arc<CascadeCache>,
    pipeline: Arc<IndexingPipeline>,
    graph: Arc<GraphConstructor>,
    coordinator: Arc<WorkCoordinator>,
    search: SearchEngine,
}

impl MnemoService {
    /// Open with in-process defaults: memory-backed shared cache,
    /// deterministic embedder, oracle per configuration.
    pub async fn open(data_dir: &Path, config: AppConfig) -> Result<Self, ServiceError> {
        let oracle = if config.oracle.enabled {
            OracleClient::new(&config.oracle, || {
                Arc::new(StaticOracle::new()) as Arc<dyn mnemolite_ingestion::TypeOracle>
            })
        } else {
            OracleClient::disabled()
        };

        Self::open_with(
            data_dir,
            config,
            Arc::new(MemoryCache::new()),
            Arc::new(DeterministicEmbedder::new(256)),
            oracle,
            Arc::new(TracingEventSink),
        )
        .await
    }

    pub async fn open_with(
        data_dir: &Path,
        config: AppConfig,
        l2: Arc<dyn SharedCache>,
        embedder: Arc<dyn Embedder>,
        oracle: OracleClient,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, ServiceError> {
        let store = Arc::new(MetaStore::open(data_dir.join("mnemolite.txlog")).await?);
        let l1 = Arc::new(ChunkCache::new(config.l1.max_bytes));
        let cascade = Arc::new(CascadeCache::new(
            l1.clone(),
            l2.clone(),
            Duration::from_secs(config.l2.ttl_chunks_s),
        ));

        let pipeline = Arc::new(IndexingPipeline::new(
            store.clone(),
            cascade.clone(),
            embedder.clone(),
            Arc::new(ExtractorRegistry::with_defaults()),
            Arc::new(oracle),
            events.clone(),
            config.pipeline.clone(),
        ));
        let graph = Arc::new(GraphConstructor::new(store.clone(), events.clone()));
        let coordinator = Arc::new(WorkCoordinator::new(
            pipeline.clone(),
            graph.clone(),
            store.clone(),
            cascade.clone(),
            l2.clone(),
            events,
            config.clone(),
        ));
        let search = SearchEngine::new(
            store.clone(),
            l2.clone(),
            embedder,
            Duration::from_secs(config.l2.ttl_search_s),
        );

        Ok(Self {
            store,
            l1,
            l2,
            cascade,
            pipeline,
            graph,
            coordinator,
            search,
        })
    }

    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    pub async fn index_file(
        &self,
        repository: &str,
        file_path: &str,
        bytes: &[u8],
    ) -> FileIndexResult {
        let trace_id = new_trace_id();
        self.pipeline
            .index_file(repository, file_path, bytes, &trace_id)
            .await
    }

    /// Forced single-file rebuild: drops every cached version first so the
    /// pipeline cannot short-circuit.
    pub async fn reindex_file(
        &self,
        repository: &str,
        file_path: &str,
        bytes: &[u8],
    ) -> FileIndexResult {
        self.cascade.invalidate(file_path).await;
        self.index_file(repository, file_path, bytes).await
    }

    pub async fn index_repository(
        &self,
        repository: &str,
        root: &Path,
        options: IndexOptions,
    ) -> Result<IndexSummary, CoordinatorError> {
        self.coordinator
            .index_repository(repository, root, options)
            .await
    }

    pub async fn get_indexing_status(&self, repository: &str) -> IndexingStatus {
        self.coordinator.indexing_status(repository).await
    }

    /// Re-derive nodes, edges and metrics for a repository from its
    /// persisted chunks.
    pub async fn rebuild_graph(&self, repository: &str) -> GraphBuildReport {
        self.graph.build(repository, &new_trace_id()).await
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, SearchError> {
        self.search.search(request).await
    }

    pub async fn clear_cache(&self, scope: CacheScope) -> Acknowledgement {
        match &scope {
            CacheScope::All => {
                self.l1.clear();
                self.l2.delete_pattern("chunks:*").await;
                self.l2.delete_pattern("search:*").await;
            }
            CacheScope::Repository(repository) => {
                let files: BTreeSet<String> = self
                    .store
                    .chunks_for_repository(repository)
                    .await
                    .into_iter()
                    .map(|chunk| chunk.file_path)
                    .collect();
                for file in files {
                    self.cascade.invalidate(&file).await;
                }
                self.l2.delete_pattern("search:*").await;
            }
            CacheScope::File(file_path) => {
                self.cascade.invalidate(file_path).await;
            }
        }

        let scope_label = match scope {
            CacheScope::All => "all".to_string(),
            CacheScope::Repository(repository) => format!("repository:{repository}"),
            CacheScope::File(file_path) => format!("file:{file_path}"),
        };
        Acknowledgement {
            cleared: true,
            scope: scope_label,
        }
    }

    pub fn cache_stats(&self) -> CascadeStats {
        self.cascade.stats()
    }

    pub async fn repository_stats(&self, repository: &str) -> RepositoryStats {
        self.store.repository_stats(repository).await
    }
}
