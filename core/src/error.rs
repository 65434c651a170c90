use serde::{Deserialize, Serialize};

/// Stable error taxonomy surfaced to callers of every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CacheUnavailable,
    SkippedFile,
    ParseError,
    ChunkingError,
    EmbeddingError,
    OracleError,
    PersistError,
    Timeout,
    LockDenied,
    UnknownLanguage,
    InvalidInput,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::CacheUnavailable => "cache_unavailable",
            ErrorKind::SkippedFile => "skipped_file",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::ChunkingError => "chunking_error",
            ErrorKind::EmbeddingError => "embedding_error",
            ErrorKind::OracleError => "oracle_error",
            ErrorKind::PersistError => "persist_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::LockDenied => "lock_denied",
            ErrorKind::UnknownLanguage => "unknown_language",
            ErrorKind::InvalidInput => "invalid_input",
        };
        write!(f, "{}", s)
    }
}

pub trait KindedError: std::error::Error {
    fn error_kind(&self) -> ErrorKind;
}
