use crate::txlog::{TxLog, TxLogError};
use crate::vectors::EmbeddingIndex;
use mnemolite_core::embedding::EmbeddingDomain;
use mnemolite_core::error::{ErrorKind, KindedError};
use mnemolite_core::model::{Chunk, ChunkKind, ComputedMetrics, Edge, EdgeType, Node, NodeType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transaction log error: {0}")]
    Log(#[from] TxLogError),
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),
}

impl KindedError for StoreError {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::PersistError
    }
}

/// One mutation inside a store transaction. A transaction is committed to
/// the log as a single frame and applied to the in-memory tables atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreOp {
    /// Atomic per-file replacement: delete every chunk of
    /// `(repository, file_path)`, then insert the new set.
    ReplaceFileChunks {
        repository: String,
        file_path: String,
        chunks: Vec<Chunk>,
    },
    /// INSERT … ON CONFLICT (repository, qualified_name, node_type) DO UPDATE.
    UpsertNode(Node),
    /// INSERT … ON CONFLICT (source, target, edge_type) DO NOTHING.
    InsertEdge(Edge),
    /// INSERT … ON CONFLICT (node_id) DO UPDATE. A plain UPDATE silently
    /// drops the row on first write; this op must never degrade to one.
    UpsertMetrics(ComputedMetrics),
    DeleteChunk(uuid::Uuid),
    DeleteRepository { repository: String },
}

/// One log-framed commit: the ops of a single store transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxRecord {
    pub(crate) ops: Vec<StoreOp>,
}

type ChunkKey = (String, String, String, ChunkKind);
type NodeKey = (String, String, NodeType);
type EdgeKey = (uuid::Uuid, uuid::Uuid, EdgeType);

struct Tables {
    chunks: HashMap<uuid::Uuid, Chunk>,
    chunk_unique: HashMap<ChunkKey, uuid::Uuid>,
    chunks_by_file: HashMap<(String, String), HashSet<uuid::Uuid>>,
    embeddings: EmbeddingIndex,
    nodes: HashMap<uuid::Uuid, Node>,
    node_unique: HashMap<NodeKey, uuid::Uuid>,
    edges: HashMap<uuid::Uuid, Edge>,
    edge_unique: HashMap<EdgeKey, uuid::Uuid>,
    metrics: HashMap<uuid::Uuid, ComputedMetrics>,
}

impl Tables {
    fn empty() -> Self {
        Self {
            chunks: HashMap::new(),
            chunk_unique: HashMap::new(),
            chunks_by_file: HashMap::new(),
            embeddings: EmbeddingIndex::new(),
            nodes: HashMap::new(),
            node_unique: HashMap::new(),
            edges: HashMap::new(),
            edge_unique: HashMap::new(),
            metrics: HashMap::new(),
        }
    }

    fn remove_chunk(&mut self, chunk_id: &uuid::Uuid) {
        if let Some(chunk) = self.chunks.remove(chunk_id) {
            self.chunk_unique.remove(&chunk.unique_key());
            let file_key = (chunk.repository.clone(), chunk.file_path.clone());
            let now_empty = match self.chunks_by_file.get_mut(&file_key) {
                Some(ids) => {
                    ids.remove(chunk_id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.chunks_by_file.remove(&file_key);
            }
            self.embeddings.remove(chunk_id);
        }
    }

    fn insert_chunk(&mut self, mut chunk: Chunk) {
        // Logical replacement of an unchanged identity keeps its birth time.
        if let Some(previous) = self.chunks.get(&chunk.chunk_id) {
            chunk.created_at = previous.created_at.clone();
        }

        self.embeddings.index_chunk(&chunk);

        self.chunk_unique.insert(chunk.unique_key(), chunk.chunk_id);
        self.chunks_by_file
            .entry((chunk.repository.clone(), chunk.file_path.clone()))
            .or_default()
            .insert(chunk.chunk_id);
        self.chunks.insert(chunk.chunk_id, chunk);
    }

    fn apply(&mut self, op: &StoreOp) {
        match op {
            StoreOp::ReplaceFileChunks {
                repository,
                file_path,
                chunks,
            } => {
                let stale: Vec<uuid::Uuid> = self
                    .chunks_by_file
                    .get(&(repository.clone(), file_path.clone()))
                    .map(|ids| ids.iter().copied().collect())
                    .unwrap_or_default();
                // Preserve created_at across the delete/insert pair.
                let birth_times: HashMap<uuid::Uuid, String> = stale
                    .iter()
                    .filter_map(|id| {
                        self.chunks
                            .get(id)
                            .map(|chunk| (*id, chunk.created_at.clone()))
                    })
                    .collect();
                for id in stale {
                    self.remove_chunk(&id);
                }
                for chunk in chunks {
                    let mut chunk = chunk.clone();
                    if let Some(created_at) = birth_times.get(&chunk.chunk_id) {
                        chunk.created_at = created_at.clone();
                    }
                    self.insert_chunk(chunk);
                }
            }
            StoreOp::UpsertNode(node) => {
                let key = (
                    node.repository.clone(),
                    node.qualified_name.clone(),
                    node.node_type,
                );
                if let Some(existing_id) = self.node_unique.get(&key).copied() {
                    if existing_id != node.node_id {
                        self.nodes.remove(&existing_id);
                    }
                }
                self.node_unique.insert(key, node.node_id);
                self.nodes.insert(node.node_id, node.clone());
            }
            StoreOp::InsertEdge(edge) => {
                let key = (edge.source_node_id, edge.target_node_id, edge.edge_type);
                if !self.edge_unique.contains_key(&key) {
                    self.edge_unique.insert(key, edge.edge_id);
                    self.edges.insert(edge.edge_id, edge.clone());
                }
            }
            StoreOp::UpsertMetrics(metrics) => {
                self.metrics.insert(metrics.node_id, metrics.clone());
            }
            StoreOp::DeleteChunk(chunk_id) => {
                self.remove_chunk(chunk_id);
            }
            StoreOp::DeleteRepository { repository } => {
                let chunk_ids: Vec<uuid::Uuid> = self
                    .chunks
                    .values()
                    .filter(|chunk| &chunk.repository == repository)
                    .map(|chunk| chunk.chunk_id)
                    .collect();
                for id in chunk_ids {
                    self.remove_chunk(&id);
                }

                let node_ids: HashSet<uuid::Uuid> = self
                    .nodes
                    .values()
                    .filter(|node| &node.repository == repository)
                    .map(|node| node.node_id)
                    .collect();
                self.nodes.retain(|id, _| !node_ids.contains(id));
                self.node_unique.retain(|_, id| !node_ids.contains(id));
                self.edges.retain(|_, edge| {
                    !node_ids.contains(&edge.source_node_id)
                        && !node_ids.contains(&edge.target_node_id)
                });
                self.edge_unique
                    .retain(|(source, target, _), _| {
                        !node_ids.contains(source) && !node_ids.contains(target)
                    });
                self.metrics
                    .retain(|_, metrics| &metrics.repository != repository);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryStats {
    pub repository: String,
    pub total_chunks: usize,
    pub nodes: usize,
    pub edges: usize,
    pub languages: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_indexed_at: Option<String>,
}

/// Metadata store holding the chunk, node, edge and metrics tables,
/// materialized from the transaction log. Durability first: a commit is
/// framed and fsynced before readers can observe it; replay on open
/// restores every table.
pub struct MetaStore {
    log: Arc<Mutex<TxLog>>,
    tx_lock: Arc<Mutex<()>>,
    tables: Arc<RwLock<Tables>>,
}

impl MetaStore {
    pub async fn open(log_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut log = TxLog::open(log_path).await?;
        let mut tables = Tables::empty();

        log.replay(|_sequence, record| {
            for op in &record.ops {
                tables.apply(op);
            }
        })
        .await?;

        Ok(Self {
            log: Arc::new(Mutex::new(log)),
            tx_lock: Arc::new(Mutex::new(())),
            tables: Arc::new(RwLock::new(tables)),
        })
    }

    /// Apply mutations atomically within one transaction boundary.
    /// If validation fails, nothing is committed to the log or the tables.
    pub async fn apply_transaction(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        if ops.is_empty() {
            return Ok(());
        }

        // Serialize validation and apply to avoid TOCTOU between writers.
        let _tx_guard = self.tx_lock.lock().await;

        self.validate_transaction(&ops).await?;

        // Durability first for the full transaction boundary.
        {
            let mut log = self.log.lock().await;
            log.append_transaction(&TxRecord { ops: ops.clone() }).await?;
            log.sync().await?;
        }

        let mut tables = self.tables.write().await;
        for op in &ops {
            tables.apply(op);
        }

        Ok(())
    }

    async fn validate_transaction(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let tables = self.tables.read().await;
        let mut visible_nodes: HashSet<uuid::Uuid> = tables.nodes.keys().copied().collect();

        for op in ops {
            match op {
                StoreOp::ReplaceFileChunks {
                    repository,
                    file_path,
                    chunks,
                } => {
                    let mut seen: HashSet<(String, ChunkKind)> = HashSet::new();
                    for chunk in chunks {
                        if &chunk.repository != repository || &chunk.file_path != file_path {
                            return Err(StoreError::InvalidTransaction(format!(
                                "chunk {} does not belong to ({repository}, {file_path})",
                                chunk.chunk_id
                            )));
                        }
                        if chunk.end_line < chunk.start_line {
                            return Err(StoreError::InvalidTransaction(format!(
                                "chunk {} has end_line < start_line",
                                chunk.qualified_name
                            )));
                        }
                        if !seen.insert((chunk.qualified_name.clone(), chunk.kind)) {
                            return Err(StoreError::InvalidTransaction(format!(
                                "duplicate qualified name in file: {}",
                                chunk.qualified_name
                            )));
                        }
                    }
                }
                StoreOp::UpsertNode(node) => {
                    visible_nodes.insert(node.node_id);
                }
                StoreOp::InsertEdge(edge) => {
                    if !visible_nodes.contains(&edge.source_node_id) {
                        return Err(StoreError::InvalidTransaction(format!(
                            "edge source {} does not exist",
                            edge.source_node_id
                        )));
                    }
                    if !visible_nodes.contains(&edge.target_node_id) {
                        return Err(StoreError::InvalidTransaction(format!(
                            "edge target {} does not exist",
                            edge.target_node_id
                        )));
                    }
                }
                StoreOp::UpsertMetrics(metrics) => {
                    if !visible_nodes.contains(&metrics.node_id) {
                        return Err(StoreError::InvalidTransaction(format!(
                            "metrics for unknown node {}",
                            metrics.node_id
                        )));
                    }
                }
                StoreOp::DeleteChunk(_) => {}
                StoreOp::DeleteRepository { repository } => {
                    let removed: Vec<uuid::Uuid> = tables
                        .nodes
                        .values()
                        .filter(|node| &node.repository == repository)
                        .map(|node| node.node_id)
                        .collect();
                    for id in removed {
                        visible_nodes.remove(&id);
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn replace_file_chunks(
        &self,
        repository: &str,
        file_path: &str,
        chunks: Vec<Chunk>,
    ) -> Result<(), StoreError> {
        self.apply_transaction(vec![StoreOp::ReplaceFileChunks {
            repository: repository.to_string(),
            file_path: file_path.to_string(),
            chunks,
        }])
        .await
    }

    pub async fn upsert_node(&self, node: Node) -> Result<(), StoreError> {
        self.apply_transaction(vec![StoreOp::UpsertNode(node)]).await
    }

    pub async fn insert_edge(&self, edge: Edge) -> Result<(), StoreError> {
        self.apply_transaction(vec![StoreOp::InsertEdge(edge)]).await
    }

    pub async fn upsert_metrics(&self, metrics: ComputedMetrics) -> Result<(), StoreError> {
        self.apply_transaction(vec![StoreOp::UpsertMetrics(metrics)])
            .await
    }

    pub async fn delete_chunk(&self, chunk_id: uuid::Uuid) -> Result<(), StoreError> {
        self.apply_transaction(vec![StoreOp::DeleteChunk(chunk_id)])
            .await
    }

    pub async fn delete_repository(&self, repository: &str) -> Result<(), StoreError> {
        self.apply_transaction(vec![StoreOp::DeleteRepository {
            repository: repository.to_string(),
        }])
        .await
    }

    pub async fn chunk(&self, chunk_id: &uuid::Uuid) -> Option<Chunk> {
        let tables = self.tables.read().await;
        tables.chunks.get(chunk_id).cloned()
    }

    pub async fn chunks_for_file(&self, repository: &str, file_path: &str) -> Vec<Chunk> {
        let tables = self.tables.read().await;
        let mut out: Vec<Chunk> = tables
            .chunks_by_file
            .get(&(repository.to_string(), file_path.to_string()))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| tables.chunks.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|chunk| (chunk.start_line, chunk.qualified_name.clone()));
        out
    }

    pub async fn chunks_for_repository(&self, repository: &str) -> Vec<Chunk> {
        self.chunks_where(|chunk| chunk.repository == repository)
            .await
    }

    pub async fn chunks_where(&self, filter: impl Fn(&Chunk) -> bool) -> Vec<Chunk> {
        let tables = self.tables.read().await;
        let mut out: Vec<Chunk> = tables
            .chunks
            .values()
            .filter(|chunk| filter(chunk))
            .cloned()
            .collect();
        out.sort_by_key(|chunk| {
            (
                chunk.file_path.clone(),
                chunk.start_line,
                chunk.qualified_name.clone(),
            )
        });
        out
    }

    /// Nearest-neighbor candidates in one embedding domain. A kind, when
    /// given, is discarded inside the index before scoring; the filter
    /// then judges the surviving chunks.
    pub async fn vector_search(
        &self,
        domain: EmbeddingDomain,
        query: &[f32],
        k: usize,
        kind: Option<ChunkKind>,
        filter: impl Fn(&Chunk) -> bool,
    ) -> Vec<(uuid::Uuid, f32)> {
        let tables = self.tables.read().await;
        tables.embeddings.search(domain, query, k, kind, |id| {
            tables.chunks.get(id).map(&filter).unwrap_or(false)
        })
    }

    pub async fn node(&self, node_id: &uuid::Uuid) -> Option<Node> {
        let tables = self.tables.read().await;
        tables.nodes.get(node_id).cloned()
    }

    pub async fn node_by_key(
        &self,
        repository: &str,
        qualified_name: &str,
        node_type: NodeType,
    ) -> Option<Node> {
        let tables = self.tables.read().await;
        tables
            .node_unique
            .get(&(
                repository.to_string(),
                qualified_name.to_string(),
                node_type,
            ))
            .and_then(|id| tables.nodes.get(id).cloned())
    }

    pub async fn nodes_for_repository(&self, repository: &str) -> Vec<Node> {
        let tables = self.tables.read().await;
        let mut out: Vec<Node> = tables
            .nodes
            .values()
            .filter(|node| node.repository == repository)
            .cloned()
            .collect();
        out.sort_by_key(|node| (node.qualified_name.clone(), node.node_type.as_str()));
        out
    }

    pub async fn edges_for_repository(&self, repository: &str) -> Vec<Edge> {
        let tables = self.tables.read().await;
        let repo_nodes: HashSet<uuid::Uuid> = tables
            .nodes
            .values()
            .filter(|node| node.repository == repository)
            .map(|node| node.node_id)
            .collect();
        let mut out: Vec<Edge> = tables
            .edges
            .values()
            .filter(|edge| repo_nodes.contains(&edge.source_node_id))
            .cloned()
            .collect();
        out.sort_by_key(|edge| (edge.source_node_id, edge.target_node_id, edge.edge_type.as_str()));
        out
    }

    pub async fn metrics_for_node(&self, node_id: &uuid::Uuid) -> Option<ComputedMetrics> {
        let tables = self.tables.read().await;
        tables.metrics.get(node_id).cloned()
    }

    pub async fn metrics_for_repository(&self, repository: &str) -> Vec<ComputedMetrics> {
        let tables = self.tables.read().await;
        let mut out: Vec<ComputedMetrics> = tables
            .metrics
            .values()
            .filter(|metrics| metrics.repository == repository)
            .cloned()
            .collect();
        out.sort_by_key(|metrics| metrics.node_id);
        out
    }

    pub async fn repository_stats(&self, repository: &str) -> RepositoryStats {
        let tables = self.tables.read().await;
        let mut languages: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_chunks = 0usize;
        let mut last_indexed_at: Option<String> = None;

        for chunk in tables.chunks.values() {
            if chunk.repository != repository {
                continue;
            }
            total_chunks += 1;
            *languages.entry(chunk.language.as_str().to_string()).or_default() += 1;
            if last_indexed_at
                .as_deref()
                .map(|current| chunk.updated_at.as_str() > current)
                .unwrap_or(true)
            {
                last_indexed_at = Some(chunk.updated_at.clone());
            }
        }

        let repo_nodes: HashSet<uuid::Uuid> = tables
            .nodes
            .values()
            .filter(|node| node.repository == repository)
            .map(|node| node.node_id)
            .collect();
        let edges = tables
            .edges
            .values()
            .filter(|edge| repo_nodes.contains(&edge.source_node_id))
            .count();

        RepositoryStats {
            repository: repository.to_string(),
            total_chunks,
            nodes: repo_nodes.len(),
            edges,
            languages,
            last_indexed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemolite_core::fingerprint::Fingerprint;
    use mnemolite_core::model::{now_rfc3339, ChunkMetadata, Language};
    use tempfile::tempdir;

    fn chunk(repo: &str, file: &str, name: &str) -> Chunk {
        let qualified = format!("module.{name}");
        Chunk {
            chunk_id: Chunk::identity_id(
                repo,
                file,
                Language::Python,
                ChunkKind::Function,
                &qualified,
            ),
            repository: repo.to_string(),
            file_path: file.to_string(),
            language: Language::Python,
            kind: ChunkKind::Function,
            name: name.to_string(),
            qualified_name: qualified,
            start_line: 1,
            end_line: 2,
            source_code: format!("def {name}(): pass"),
            metadata: ChunkMetadata::basic(Fingerprint::of(name.as_bytes()), 2),
            embedding_text: Some(vec![1.0, 0.0]),
            embedding_code: Some(vec![0.0, 1.0]),
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
        }
    }

    fn node(repo: &str, qualified_name: &str) -> Node {
        Node {
            node_id: Node::identity_id(repo, qualified_name, NodeType::Function),
            node_type: NodeType::Function,
            qualified_name: qualified_name.to_string(),
            repository: repo.to_string(),
            chunk_id: None,
            properties: BTreeMap::new(),
            created_at: now_rfc3339(),
        }
    }

    #[tokio::test]
    async fn test_replace_and_read_chunks() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("store.txlog")).await.unwrap();

        let chunks = vec![chunk("repo", "a.py", "f"), chunk("repo", "a.py", "g")];
        store
            .replace_file_chunks("repo", "a.py", chunks.clone())
            .await
            .unwrap();

        let read = store.chunks_for_file("repo", "a.py").await;
        assert_eq!(read.len(), 2);
    }

    #[tokio::test]
    async fn test_replace_drops_stale_chunks() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("store.txlog")).await.unwrap();

        store
            .replace_file_chunks(
                "repo",
                "a.py",
                vec![chunk("repo", "a.py", "old_one"), chunk("repo", "a.py", "old_two")],
            )
            .await
            .unwrap();
        store
            .replace_file_chunks("repo", "a.py", vec![chunk("repo", "a.py", "fresh")])
            .await
            .unwrap();

        let read = store.chunks_for_file("repo", "a.py").await;
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].name, "fresh");
    }

    #[tokio::test]
    async fn test_replay_on_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("replay.txlog");

        {
            let store = MetaStore::open(&path).await.unwrap();
            store
                .replace_file_chunks("repo", "a.py", vec![chunk("repo", "a.py", "f")])
                .await
                .unwrap();
            store.upsert_node(node("repo", "module.f")).await.unwrap();
        }

        {
            let store = MetaStore::open(&path).await.unwrap();
            assert_eq!(store.chunks_for_file("repo", "a.py").await.len(), 1);
            assert_eq!(store.nodes_for_repository("repo").await.len(), 1);
            // The embedding index is rebuilt from replayed chunks.
            let hits = store
                .vector_search(EmbeddingDomain::Text, &[1.0, 0.0], 1, None, |_| true)
                .await;
            assert_eq!(hits.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_invalid_edge() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("txn.txlog")).await.unwrap();

        let n = node("repo", "module.f");
        let missing = uuid::Uuid::new_v4();
        let result = store
            .apply_transaction(vec![
                StoreOp::UpsertNode(n.clone()),
                StoreOp::InsertEdge(Edge::new(n.node_id, missing, EdgeType::Calls)),
            ])
            .await;

        assert!(result.is_err());
        assert!(
            store.node(&n.node_id).await.is_none(),
            "node should not be partially committed"
        );
    }

    #[tokio::test]
    async fn test_edge_dedup_is_a_noop() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("dedup.txlog")).await.unwrap();

        let a = node("repo", "module.a");
        let b = node("repo", "module.b");
        store.upsert_node(a.clone()).await.unwrap();
        store.upsert_node(b.clone()).await.unwrap();

        store
            .insert_edge(Edge::new(a.node_id, b.node_id, EdgeType::Calls))
            .await
            .unwrap();
        store
            .insert_edge(Edge::new(a.node_id, b.node_id, EdgeType::Calls))
            .await
            .unwrap();

        assert_eq!(store.edges_for_repository("repo").await.len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_upsert_first_write_and_rewrite() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("metrics.txlog")).await.unwrap();

        let n = node("repo", "module.f");
        store.upsert_node(n.clone()).await.unwrap();

        // First write: the row does not exist yet and must be created.
        store
            .upsert_metrics(ComputedMetrics {
                node_id: n.node_id,
                chunk_id: None,
                repository: "repo".to_string(),
                coupling: Some(0.5),
                pagerank: None,
                updated_at: now_rfc3339(),
            })
            .await
            .unwrap();
        assert_eq!(
            store.metrics_for_node(&n.node_id).await.unwrap().coupling,
            Some(0.5)
        );

        // Rewrite: the same key updates in place, still exactly one row.
        store
            .upsert_metrics(ComputedMetrics {
                node_id: n.node_id,
                chunk_id: None,
                repository: "repo".to_string(),
                coupling: Some(0.9),
                pagerank: Some(0.1),
                updated_at: now_rfc3339(),
            })
            .await
            .unwrap();
        let rows = store.metrics_for_repository("repo").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].coupling, Some(0.9));
    }

    #[tokio::test]
    async fn test_delete_repository_purges_all_tables() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("purge.txlog")).await.unwrap();

        let a = node("repo", "module.a");
        let b = node("repo", "module.b");
        store
            .replace_file_chunks("repo", "a.py", vec![chunk("repo", "a.py", "a")])
            .await
            .unwrap();
        store.upsert_node(a.clone()).await.unwrap();
        store.upsert_node(b.clone()).await.unwrap();
        store
            .insert_edge(Edge::new(a.node_id, b.node_id, EdgeType::Imports))
            .await
            .unwrap();
        store
            .upsert_metrics(ComputedMetrics {
                node_id: a.node_id,
                chunk_id: None,
                repository: "repo".to_string(),
                coupling: None,
                pagerank: None,
                updated_at: now_rfc3339(),
            })
            .await
            .unwrap();

        store.delete_repository("repo").await.unwrap();

        assert!(store.chunks_for_repository("repo").await.is_empty());
        assert!(store.nodes_for_repository("repo").await.is_empty());
        assert!(store.edges_for_repository("repo").await.is_empty());
        assert!(store.metrics_for_repository("repo").await.is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_identity_keeps_created_at() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("birth.txlog")).await.unwrap();

        let first = chunk("repo", "a.py", "f");
        let original_created = first.created_at.clone();
        store
            .replace_file_chunks("repo", "a.py", vec![first])
            .await
            .unwrap();

        let mut second = chunk("repo", "a.py", "f");
        second.created_at = "2999-01-01T00:00:00+00:00".to_string();
        store
            .replace_file_chunks("repo", "a.py", vec![second])
            .await
            .unwrap();

        let read = store.chunks_for_file("repo", "a.py").await;
        assert_eq!(read[0].created_at, original_created);
    }

    #[tokio::test]
    async fn test_hard_deleted_chunk_does_not_break_reads() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("hard.txlog")).await.unwrap();

        let c = chunk("repo", "a.py", "f");
        store
            .replace_file_chunks("repo", "a.py", vec![c.clone()])
            .await
            .unwrap();

        store.delete_chunk(c.chunk_id).await.unwrap();
        // Deleting a missing row is a no-op, not an error.
        store.delete_chunk(c.chunk_id).await.unwrap();

        assert!(store.chunk(&c.chunk_id).await.is_none());
        assert!(store.chunks_for_file("repo", "a.py").await.is_empty());
        let stats = store.repository_stats("repo").await;
        assert_eq!(stats.total_chunks, 0);
    }

    #[tokio::test]
    async fn test_repository_stats_counts_languages() {
        let dir = tempdir().unwrap();
        let store = MetaStore::open(dir.path().join("stats.txlog")).await.unwrap();

        store
            .replace_file_chunks(
                "repo",
                "a.py",
                vec![chunk("repo", "a.py", "f"), chunk("repo", "a.py", "g")],
            )
            .await
            .unwrap();

        let stats = store.repository_stats("repo").await;
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.languages.get("python"), Some(&2));
        assert!(stats.last_indexed_at.is_some());
    }
}
