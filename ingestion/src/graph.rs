use mnemolite_core::events::{CoreEvent, EventKind, EventSink};
use mnemolite_core::model::{
    now_rfc3339, Chunk, ComputedMetrics, Edge, EdgeType, Node, NodeType,
};
use mnemolite_storage::MetaStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GraphBuildReport {
    pub repository: String,
    pub nodes_upserted: usize,
    pub edges_inserted: usize,
    pub unresolved_references: usize,
    pub errors: usize,
}

#[derive(Debug, Clone)]
struct SymbolEntry {
    node_id: Uuid,
    node_type: NodeType,
}

/// Per-build symbol table: qualified name → node, plus an index on the
/// trailing name segment for suffix resolution.
struct SymbolTable {
    by_qualified: HashMap<String, SymbolEntry>,
    by_name: HashMap<String, Vec<String>>,
}

impl SymbolTable {
    fn build(repository: &str, chunks: &[Chunk]) -> Self {
        let mut by_qualified: HashMap<String, SymbolEntry> = HashMap::new();
        let mut by_name: HashMap<String, Vec<String>> = HashMap::new();

        for chunk in chunks {
            let Some(node_type) = NodeType::from_chunk_kind(chunk.kind) else {
                continue;
            };
            if by_qualified.contains_key(&chunk.qualified_name) {
                warn!(
                    qualified_name = %chunk.qualified_name,
                    "duplicate qualified name in repository; keeping first"
                );
                continue;
            }

            let entry = SymbolEntry {
                node_id: Node::identity_id(repository, &chunk.qualified_name, node_type),
                node_type,
            };
            by_qualified.insert(chunk.qualified_name.clone(), entry);

            let name = chunk
                .qualified_name
                .rsplit('.')
                .next()
                .unwrap_or(&chunk.qualified_name)
                .to_string();
            by_name
                .entry(name)
                .or_default()
                .push(chunk.qualified_name.clone());
        }

        Self {
            by_qualified,
            by_name,
        }
    }

    /// Resolution rules: (a) exact qualified-name match; (b) suffix match
    /// where the reference's trailing segment names exactly one symbol, or
    /// the symbol's full qualified name is a suffix of the reference.
    fn resolve(&self, reference: &str) -> Option<&SymbolEntry> {
        if let Some(entry) = self.by_qualified.get(reference) {
            return Some(entry);
        }

        let last = reference.rsplit('.').next()?;
        let candidates = self.by_name.get(last)?;

        if let Some(qualified) = candidates
            .iter()
            .find(|qualified| reference.ends_with(&format!(".{qualified}")))
        {
            return self.by_qualified.get(qualified.as_str());
        }

        if candidates.len() == 1 {
            return self.by_qualified.get(candidates[0].as_str());
        }

        None
    }

    /// Call references branch on the dot: `o.m` tries `m` as a method
    /// (preferring a receiver-matching class), then as a free function,
    /// then falls back to plain resolution of the full reference.
    fn resolve_call(&self, call: &str) -> Option<&SymbolEntry> {
        let Some((receiver, method)) = call.rsplit_once('.') else {
            return self.resolve(call);
        };

        if let Some(candidates) = self.by_name.get(method) {
            let methods: Vec<&String> = candidates
                .iter()
                .filter(|qualified| {
                    self.by_qualified
                        .get(qualified.as_str())
                        .map(|entry| entry.node_type == NodeType::Method)
                        .unwrap_or(false)
                })
                .collect();

            match methods.len() {
                1 => return self.by_qualified.get(methods[0].as_str()),
                n if n > 1 => {
                    // Static-call shape: the receiver names the class segment.
                    if let Some(qualified) = methods.iter().find(|qualified| {
                        qualified
                            .rsplit('.')
                            .nth(1)
                            .map(|class| class == receiver)
                            .unwrap_or(false)
                    }) {
                        return self.by_qualified.get(qualified.as_str());
                    }
                }
                _ => {}
            }

            let functions: Vec<&String> = candidates
                .iter()
                .filter(|qualified| {
                    self.by_qualified
                        .get(qualified.as_str())
                        .map(|entry| entry.node_type == NodeType::Function)
                        .unwrap_or(false)
                })
                .collect();
            if functions.len() == 1 {
                return self.by_qualified.get(functions[0].as_str());
            }
        }

        self.resolve(call)
    }
}

/// Derives the repository graph from persisted chunk metadata. Runs once
/// per repository after the per-file pipeline, as the single writer over
/// nodes, edges and metrics.
pub struct GraphConstructor {
    store: Arc<MetaStore>,
    events: Arc<dyn EventSink>,
}

impl GraphConstructor {
    pub fn new(store: Arc<MetaStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    pub async fn build(&self, repository: &str, trace_id: &str) -> GraphBuildReport {
        let chunks = self.store.chunks_for_repository(repository).await;
        let symbols = SymbolTable::build(repository, &chunks);

        let mut report = GraphBuildReport {
            repository: repository.to_string(),
            nodes_upserted: 0,
            edges_inserted: 0,
            unresolved_references: 0,
            errors: 0,
        };

        // Node upsert pass.
        for chunk in &chunks {
            let Some(node_type) = NodeType::from_chunk_kind(chunk.kind) else {
                continue;
            };
            let Some(entry) = symbols.by_qualified.get(&chunk.qualified_name) else {
                continue; // duplicate dropped during table build
            };
            if entry.node_type != node_type
                || entry.node_id != Node::identity_id(repository, &chunk.qualified_name, node_type)
            {
                continue;
            }

            let mut properties = std::collections::BTreeMap::new();
            properties.insert("file_path".to_string(), chunk.file_path.clone());
            properties.insert("language".to_string(), chunk.language.as_str().to_string());
            properties.insert("kind".to_string(), chunk.kind.as_str().to_string());

            let node = Node {
                node_id: entry.node_id,
                node_type,
                qualified_name: chunk.qualified_name.clone(),
                repository: repository.to_string(),
                chunk_id: Some(chunk.chunk_id),
                properties,
                created_at: now_rfc3339(),
            };

            match self.store.upsert_node(node).await {
                Ok(()) => {
                    report.nodes_upserted += 1;
                    let _ = self.events.record(
                        CoreEvent::new(EventKind::GraphUpsertNode, trace_id)
                            .with_repository(repository)
                            .with_detail("qualified_name", chunk.qualified_name.clone()),
                    );
                }
                Err(err) => {
                    warn!(qualified_name = %chunk.qualified_name, error = %err, "node upsert failed");
                    report.errors += 1;
                }
            }
        }

        // Edge derivation pass. Unresolved references are expected
        // (external imports, stdlib calls) and skipped silently.
        let mut degree: HashMap<Uuid, u32> = HashMap::new();
        for chunk in &chunks {
            let Some(source) = symbols.by_qualified.get(&chunk.qualified_name) else {
                continue;
            };

            let references = chunk
                .metadata
                .imports
                .iter()
                .map(|r| (r, EdgeType::Imports))
                .chain(
                    chunk
                        .metadata
                        .re_exports
                        .iter()
                        .map(|r| (r, EdgeType::ReExports)),
                )
                .chain(chunk.metadata.calls.iter().map(|r| (r, EdgeType::Calls)));

            for (reference, edge_type) in references {
                let resolved = match edge_type {
                    EdgeType::Calls => symbols.resolve_call(reference),
                    _ => symbols.resolve(reference),
                };
                let Some(target) = resolved else {
                    report.unresolved_references += 1;
                    continue;
                };

                let mut edge = Edge::new(source.node_id, target.node_id, edge_type);
                edge.properties
                    .insert("reference".to_string(), reference.clone());

                match self.store.insert_edge(edge).await {
                    Ok(()) => {
                        report.edges_inserted += 1;
                        *degree.entry(source.node_id).or_default() += 1;
                        *degree.entry(target.node_id).or_default() += 1;
                        let _ = self.events.record(
                            CoreEvent::new(EventKind::GraphUpsertEdge, trace_id)
                                .with_repository(repository)
                                .with_detail("edge_type", edge_type.as_str().to_string()),
                        );
                    }
                    Err(err) => {
                        warn!(%reference, error = %err, "edge insert failed");
                        report.errors += 1;
                    }
                }
            }
        }

        // Metrics pass: one row per touched node, created on first write.
        for chunk in &chunks {
            let Some(entry) = symbols.by_qualified.get(&chunk.qualified_name) else {
                continue;
            };
            let metrics = ComputedMetrics {
                node_id: entry.node_id,
                chunk_id: Some(chunk.chunk_id),
                repository: repository.to_string(),
                coupling: Some(*degree.get(&entry.node_id).unwrap_or(&0) as f32),
                pagerank: None,
                updated_at: now_rfc3339(),
            };
            if let Err(err) = self.store.upsert_metrics(metrics).await {
                warn!(qualified_name = %chunk.qualified_name, error = %err, "metrics upsert failed");
                report.errors += 1;
            }
        }

        report
    }
}
