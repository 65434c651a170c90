use mnemolite_core::model::Language;
use std::path::Path;

/// Files above this size are skipped rather than parsed.
pub const MAX_FILE_BYTES: usize = 1_048_576;

pub fn detect_language(file_path: &str) -> Option<Language> {
    let ext = Path::new(file_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "py" => Some(Language::Python),
        "ts" | "tsx" => Some(Language::TypeScript),
        "js" | "jsx" | "mjs" | "cjs" => Some(Language::JavaScript),
        "rs" => Some(Language::Rust),
        _ => None,
    }
}

/// Cheap binary sniff: a NUL byte in the head marks the file as binary.
pub fn is_probably_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(4096).any(|b| *b == 0)
}
