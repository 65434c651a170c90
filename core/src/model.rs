use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Namespace for deterministic (v5) identifiers. Fixed for the lifetime of
/// a deployment: chunk and node ids derived under it are stable across
/// re-indexing runs and across sequential/parallel execution.
const ID_NAMESPACE: Uuid = Uuid::from_u128(0x6d6e_656d_6f6c_6974_6500_0000_0000_0001);

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Python,
    TypeScript,
    JavaScript,
    Rust,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::TypeScript => "typescript",
            Language::JavaScript => "javascript",
            Language::Rust => "rust",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Function,
    Method,
    Class,
    Interface,
    Enum,
    Module,
    FallbackFixed,
}

impl ChunkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkKind::Function => "function",
            ChunkKind::Method => "method",
            ChunkKind::Class => "class",
            ChunkKind::Interface => "interface",
            ChunkKind::Enum => "enum",
            ChunkKind::Module => "module",
            ChunkKind::FallbackFixed => "fallback_fixed",
        }
    }
}

impl std::fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Function,
    Method,
    Class,
    Interface,
    Enum,
    Module,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Function => "function",
            NodeType::Method => "method",
            NodeType::Class => "class",
            NodeType::Interface => "interface",
            NodeType::Enum => "enum",
            NodeType::Module => "module",
        }
    }

    /// The node type a chunk of the given kind materializes as, if any.
    /// Fallback slices are searchable but do not become graph nodes.
    pub fn from_chunk_kind(kind: ChunkKind) -> Option<Self> {
        match kind {
            ChunkKind::Function => Some(NodeType::Function),
            ChunkKind::Method => Some(NodeType::Method),
            ChunkKind::Class => Some(NodeType::Class),
            ChunkKind::Interface => Some(NodeType::Interface),
            ChunkKind::Enum => Some(NodeType::Enum),
            ChunkKind::Module => Some(NodeType::Module),
            ChunkKind::FallbackFixed => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeType {
    Calls,
    Imports,
    ReExports,
}

impl EdgeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeType::Calls => "calls",
            EdgeType::Imports => "imports",
            EdgeType::ReExports => "re_exports",
        }
    }
}

impl std::fmt::Display for EdgeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Complexity {
    pub cyclomatic: Option<u32>,
    pub lines_of_code: u32,
}

/// Open metadata record attached to a chunk. `content_hash` is mandatory;
/// everything else is best-effort extraction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub content_hash: Fingerprint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    /// Parameter name/type pairs, in declaration order.
    #[serde(default)]
    pub param_types: Vec<(String, String)>,
    #[serde(default)]
    pub imports: Vec<String>,
    /// Re-exported references; same shape as `imports`, distinct edge type.
    #[serde(default)]
    pub re_exports: Vec<String>,
    #[serde(default)]
    pub calls: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl ChunkMetadata {
    /// Minimal valid record: produced when extraction fails part-way.
    pub fn basic(content_hash: Fingerprint, lines_of_code: u32) -> Self {
        Self {
            content_hash,
            signature: None,
            return_type: None,
            param_types: Vec::new(),
            imports: Vec::new(),
            re_exports: Vec::new(),
            calls: Vec::new(),
            complexity: Complexity {
                cyclomatic: None,
                lines_of_code,
            },
            docstring: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: Uuid,
    pub repository: String,
    pub file_path: String,
    pub language: Language,
    pub kind: ChunkKind,
    pub name: String,
    /// Dotted path rooted at the module, unique per (repository, file, kind).
    pub qualified_name: String,
    pub start_line: u32,
    pub end_line: u32,
    pub source_code: String,
    pub metadata: ChunkMetadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_text: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_code: Option<Vec<f32>>,
    pub created_at: String,
    pub updated_at: String,
}

impl Chunk {
    /// Deterministic id: stable across re-index exactly when path, language,
    /// kind and name-path are unchanged. Any other change makes a new chunk.
    pub fn identity_id(
        repository: &str,
        file_path: &str,
        language: Language,
        kind: ChunkKind,
        qualified_name: &str,
    ) -> Uuid {
        let key = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}\u{1f}{}",
            repository,
            file_path,
            language.as_str(),
            kind.as_str(),
            qualified_name
        );
        Uuid::new_v5(&ID_NAMESPACE, key.as_bytes())
    }

    pub fn unique_key(&self) -> (String, String, String, ChunkKind) {
        (
            self.repository.clone(),
            self.file_path.clone(),
            self.qualified_name.clone(),
            self.kind,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: Uuid,
    pub node_type: NodeType,
    pub qualified_name: String,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<Uuid>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub created_at: String,
}

impl Node {
    pub fn identity_id(repository: &str, qualified_name: &str, node_type: NodeType) -> Uuid {
        let key = format!(
            "node\u{1f}{}\u{1f}{}\u{1f}{}",
            repository,
            qualified_name,
            node_type.as_str()
        );
        Uuid::new_v5(&ID_NAMESPACE, key.as_bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub edge_id: Uuid,
    pub source_node_id: Uuid,
    pub target_node_id: Uuid,
    pub edge_type: EdgeType,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub created_at: String,
}

impl Edge {
    pub fn new(source_node_id: Uuid, target_node_id: Uuid, edge_type: EdgeType) -> Self {
        Self {
            edge_id: Uuid::new_v4(),
            source_node_id,
            target_node_id,
            edge_type,
            properties: BTreeMap::new(),
            created_at: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedMetrics {
    pub node_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<Uuid>,
    pub repository: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupling: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagerank: Option<f32>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingState {
    NotIndexed,
    InProgress,
    Completed,
    Failed,
}

/// Ephemeral per-repository indexing progress. Lives in the shared cache
/// under a bounded TTL; losing it is recoverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexingStatus {
    pub repository: String,
    pub state: IndexingState,
    pub total_files: usize,
    pub indexed_files: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IndexingStatus {
    pub fn not_indexed(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            state: IndexingState::NotIndexed,
            total_files: 0,
            indexed_files: 0,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}
