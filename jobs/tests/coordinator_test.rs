use async_trait::async_trait;
use mnemolite_cache::{CascadeCache, ChunkCache, MemoryCache};
use mnemolite_core::config::AppConfig;
use mnemolite_core::embedding::{
    deterministic_embedding, DeterministicEmbedder, Embedder, EmbeddingDomain, EmbeddingError,
};
use mnemolite_core::events::InMemoryEventSink;
use mnemolite_core::model::{EdgeType, IndexingState};
use mnemolite_ingestion::extract::ExtractorRegistry;
use mnemolite_ingestion::{GraphConstructor, IndexingPipeline, OracleClient};
use mnemolite_jobs::{CoordinatorError, IndexOptions, RepositoryLock, WorkCoordinator};
use mnemolite_storage::MetaStore;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

struct Harness {
    coordinator: Arc<WorkCoordinator>,
    store: Arc<MetaStore>,
    l2: Arc<MemoryCache>,
}

async fn harness_with(
    dir: &Path,
    config: AppConfig,
    embedder: Arc<dyn Embedder>,
) -> Harness {
    let store = Arc::new(MetaStore::open(dir.join("meta.txlog")).await.unwrap());
    let l1 = Arc::new(ChunkCache::new(config.l1.max_bytes));
    let l2 = Arc::new(MemoryCache::new());
    let cascade = Arc::new(CascadeCache::new(
        l1,
        l2.clone(),
        Duration::from_secs(config.l2.ttl_chunks_s),
    ));
    let events = Arc::new(InMemoryEventSink::default());

    let pipeline = Arc::new(IndexingPipeline::new(
        store.clone(),
        cascade.clone(),
        embedder,
        Arc::new(ExtractorRegistry::with_defaults()),
        Arc::new(OracleClient::disabled()),
        events.clone(),
        config.pipeline.clone(),
    ));
    let graph = Arc::new(GraphConstructor::new(store.clone(), events.clone()));

    let coordinator = Arc::new(WorkCoordinator::new(
        pipeline,
        graph,
        store.clone(),
        cascade,
        l2.clone(),
        events,
        config,
    ));

    Harness {
        coordinator,
        store,
        l2,
    }
}

async fn harness(dir: &Path) -> Harness {
    harness_with(
        dir,
        AppConfig::default(),
        Arc::new(DeterministicEmbedder::new(64)),
    )
    .await
}

fn write_two_file_repo(root: &Path) {
    fs::write(
        root.join("math.ts"),
        r#"export class MathService {
    multiply(a: number, b: number): number {
        return a * b;
    }
}
"#,
    )
    .unwrap();
    fs::write(
        root.join("main.js"),
        r#"class App {
    run(service) {
        return service.multiply(6, 7);
    }
}
"#,
    )
    .unwrap();
}

#[tokio::test]
async fn test_two_file_repository_builds_chunks_nodes_and_cross_file_edge() {
    let dir = tempdir().unwrap();
    let repo_root = dir.path().join("project");
    fs::create_dir(&repo_root).unwrap();
    write_two_file_repo(&repo_root);

    let h = harness(dir.path()).await;
    let summary = h
        .coordinator
        .index_repository("repo", &repo_root, IndexOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.total_files, 2);
    assert_eq!(summary.indexed, 2);
    assert_eq!(summary.failed, 0);

    let chunks = h.store.chunks_for_repository("repo").await;
    assert!(chunks.len() >= 4); // two classes and two members

    let nodes = h.store.nodes_for_repository("repo").await;
    assert_eq!(nodes.len(), 4);

    let edges = h.store.edges_for_repository("repo").await;
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].edge_type, EdgeType::Calls);
    let source = h.store.node(&edges[0].source_node_id).await.unwrap();
    let target = h.store.node(&edges[0].target_node_id).await.unwrap();
    assert_eq!(source.qualified_name, "main.App.run");
    assert_eq!(target.qualified_name, "math.MathService.multiply");

    // Every node has exactly one metrics row.
    assert_eq!(h.store.metrics_for_repository("repo").await.len(), 4);

    let status = h.coordinator.indexing_status("repo").await;
    assert_eq!(status.state, IndexingState::Completed);

    // Re-index without changes: both files served from cache.
    let second = h
        .coordinator
        .index_repository("repo", &repo_root, IndexOptions::default())
        .await
        .unwrap();
    assert_eq!(second.cached, 2);
    assert_eq!(second.indexed, 0);
}

#[tokio::test]
async fn test_single_line_change_reindexes_only_that_file() {
    let dir = tempdir().unwrap();
    let repo_root = dir.path().join("project");
    fs::create_dir(&repo_root).unwrap();
    write_two_file_repo(&repo_root);

    let h = harness(dir.path()).await;
    h.coordinator
        .index_repository("repo", &repo_root, IndexOptions::default())
        .await
        .unwrap();

    let modified = fs::read_to_string(repo_root.join("main.js"))
        .unwrap()
        .replace("multiply(6, 7)", "multiply(7, 6)");
    fs::write(repo_root.join("main.js"), modified).unwrap();

    let summary = h
        .coordinator
        .index_repository("repo", &repo_root, IndexOptions::default())
        .await
        .unwrap();

    assert_eq!(summary.indexed, 1);
    assert_eq!(summary.cached, 1);

    // The edge set stays consistent with the rebuilt symbol table.
    let edges = h.store.edges_for_repository("repo").await;
    assert_eq!(edges.len(), 1);
}

#[tokio::test]
async fn test_concurrent_index_repository_is_lock_denied() {
    let dir = tempdir().unwrap();
    let repo_root = dir.path().join("project");
    fs::create_dir(&repo_root).unwrap();
    write_two_file_repo(&repo_root);

    let h = harness(dir.path()).await;

    // First worker holds the repository lock.
    let lock = RepositoryLock::new(h.l2.clone(), Duration::from_secs(600));
    let token = lock.acquire("repo").await.unwrap();

    let denied = h
        .coordinator
        .index_repository("repo", &repo_root, IndexOptions::default())
        .await;
    assert!(matches!(denied, Err(CoordinatorError::LockDenied(_))));

    lock.release(&token).await;
    let allowed = h
        .coordinator
        .index_repository("repo", &repo_root, IndexOptions::default())
        .await;
    assert!(allowed.is_ok());
}

#[tokio::test]
async fn test_force_reindex_purges_before_rebuilding() {
    let dir = tempdir().unwrap();
    let repo_root = dir.path().join("project");
    fs::create_dir(&repo_root).unwrap();
    write_two_file_repo(&repo_root);

    let h = harness(dir.path()).await;
    h.coordinator
        .index_repository("repo", &repo_root, IndexOptions::default())
        .await
        .unwrap();

    // Remove a file; a plain re-index would leave its chunks behind only
    // if the purge did not run.
    fs::remove_file(repo_root.join("main.js")).unwrap();

    let summary = h
        .coordinator
        .index_repository(
            "repo",
            &repo_root,
            IndexOptions {
                force_reindex: true,
                ..IndexOptions::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(summary.total_files, 1);

    let chunks = h.store.chunks_for_repository("repo").await;
    assert!(chunks.iter().all(|c| c.file_path == "math.ts"));
    let nodes = h.store.nodes_for_repository("repo").await;
    assert_eq!(nodes.len(), 2);
}

fn write_many_file_repo(root: &Path, count: usize) {
    fs::write(
        root.join("target.py"),
        "def shared_target():\n    return 1\n",
    )
    .unwrap();
    for i in 0..count {
        fs::write(
            root.join(format!("caller_{i:03}.py")),
            format!("def caller_{i}():\n    return shared_target()\n"),
        )
        .unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sequential_and_parallel_execution_are_equivalent() {
    let dir = tempdir().unwrap();
    let repo_root = dir.path().join("project");
    fs::create_dir(&repo_root).unwrap();
    write_many_file_repo(&repo_root, 60);

    let seq_dir = tempdir().unwrap();
    let mut seq_config = AppConfig::default();
    seq_config.workers.sequential_threshold = usize::MAX;
    let sequential = harness_with(
        seq_dir.path(),
        seq_config,
        Arc::new(DeterministicEmbedder::new(64)),
    )
    .await;

    let par_dir = tempdir().unwrap();
    let mut par_config = AppConfig::default();
    par_config.workers.sequential_threshold = 0;
    let parallel = harness_with(
        par_dir.path(),
        par_config,
        Arc::new(DeterministicEmbedder::new(64)),
    )
    .await;

    let seq_summary = sequential
        .coordinator
        .index_repository("repo", &repo_root, IndexOptions::default())
        .await
        .unwrap();
    let par_summary = parallel
        .coordinator
        .index_repository(
            "repo",
            &repo_root,
            IndexOptions {
                workers: 4,
                ..IndexOptions::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(seq_summary.indexed, par_summary.indexed);
    // Every worker finished its slice cleanly.
    assert!(par_summary.warnings.is_empty());

    let seq_chunks: BTreeSet<(String, String)> = sequential
        .store
        .chunks_for_repository("repo")
        .await
        .into_iter()
        .map(|c| (c.qualified_name, c.kind.as_str().to_string()))
        .collect();
    let par_chunks: BTreeSet<(String, String)> = parallel
        .store
        .chunks_for_repository("repo")
        .await
        .into_iter()
        .map(|c| (c.qualified_name, c.kind.as_str().to_string()))
        .collect();
    assert_eq!(seq_chunks, par_chunks);

    let seq_nodes: BTreeSet<String> = sequential
        .store
        .nodes_for_repository("repo")
        .await
        .into_iter()
        .map(|n| n.qualified_name)
        .collect();
    let par_nodes: BTreeSet<String> = parallel
        .store
        .nodes_for_repository("repo")
        .await
        .into_iter()
        .map(|n| n.qualified_name)
        .collect();
    assert_eq!(seq_nodes, par_nodes);

    async fn edge_set(store: &MetaStore) -> BTreeSet<(String, String, String)> {
        let mut out = BTreeSet::new();
        for edge in store.edges_for_repository("repo").await {
            let source = store.node(&edge.source_node_id).await.unwrap();
            let target = store.node(&edge.target_node_id).await.unwrap();
            out.insert((
                source.qualified_name,
                target.qualified_name,
                edge.edge_type.as_str().to_string(),
            ));
        }
        out
    }
    let seq_edges = edge_set(&sequential.store).await;
    let par_edges = edge_set(&parallel.store).await;
    assert_eq!(seq_edges, par_edges);
    assert_eq!(seq_edges.len(), 60);
}

struct SlowEmbedder {
    inner: DeterministicEmbedder,
}

#[async_trait]
impl Embedder for SlowEmbedder {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    async fn embed(
        &self,
        domain: EmbeddingDomain,
        inputs: &[String],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(inputs
            .iter()
            .map(|input| deterministic_embedding(domain, input, self.inner.dimension()))
            .collect())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_stops_new_files_and_keeps_committed_work() {
    let dir = tempdir().unwrap();
    let repo_root = dir.path().join("project");
    fs::create_dir(&repo_root).unwrap();
    write_many_file_repo(&repo_root, 200);

    let mut config = AppConfig::default();
    config.workers.sequential_threshold = usize::MAX; // deterministic order
    let h = harness_with(
        dir.path(),
        config,
        Arc::new(SlowEmbedder {
            inner: DeterministicEmbedder::new(16),
        }),
    )
    .await;

    let cancel = h.coordinator.cancellation();
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    let summary = h
        .coordinator
        .index_repository("repo", &repo_root, IndexOptions::default())
        .await
        .unwrap();
    canceller.await.unwrap();

    assert!(summary.cancelled);
    assert!(summary.indexed < summary.total_files);

    // Files committed before the cancel stay committed.
    assert!(summary.indexed > 0);
    assert!(!h.store.chunks_for_repository("repo").await.is_empty());

    let status = h.coordinator.indexing_status("repo").await;
    assert_eq!(status.state, IndexingState::Failed);
    assert_eq!(status.error.as_deref(), Some("cancelled"));
}
