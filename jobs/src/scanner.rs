use ignore::WalkBuilder;
use mnemolite_ingestion::language::detect_language;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Early warning threshold; the hard cap comes from configuration.
pub const WARN_FILES: usize = 5_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Source files with a registered language, sorted for determinism.
    pub files: Vec<PathBuf>,
    /// True when the hard cap cut the listing short.
    pub truncated: bool,
    /// True when the early-warning threshold was crossed.
    pub warned: bool,
}

/// Walk a project directory for indexable source files. Ignore files
/// (`.gitignore` and friends) are honored unless `include_ignored` is set;
/// symlinks are not followed, which also breaks symlink cycles.
pub fn scan_repository(root: &Path, include_ignored: bool, max_files: usize) -> ScanOutcome {
    let mut builder = WalkBuilder::new(root);
    builder.follow_links(false).standard_filters(!include_ignored);

    let mut files = Vec::new();
    let mut truncated = false;
    let mut warned = false;

    for entry in builder.build() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let path = entry.path();
        if detect_language(&path.to_string_lossy()).is_none() {
            continue;
        }

        files.push(path.to_path_buf());

        if !warned && files.len() >= WARN_FILES {
            warn!(
                count = files.len(),
                "repository is large; indexing may take a while"
            );
            warned = true;
        }
        if files.len() >= max_files {
            warn!(max_files, "file cap reached; remaining files are skipped");
            truncated = true;
            break;
        }
    }

    files.sort();

    ScanOutcome {
        files,
        truncated,
        warned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn scan_finds_only_supported_source_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.ts"), "export function a() {}").unwrap();
        fs::write(dir.path().join("b.py"), "def b(): pass").unwrap();
        fs::write(dir.path().join("notes.txt"), "not source").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/c.js"), "function c() {}").unwrap();

        let outcome = scan_repository(dir.path(), false, 10_000);

        assert_eq!(outcome.files.len(), 3);
        assert!(!outcome.truncated);
    }

    #[test]
    fn scan_honors_gitignore_unless_included() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(".gitignore"), "generated.ts\n").unwrap();
        fs::write(dir.path().join("kept.ts"), "export function kept() {}").unwrap();
        fs::write(dir.path().join("generated.ts"), "export function gen() {}").unwrap();

        let honored = scan_repository(dir.path(), false, 10_000);
        assert_eq!(honored.files.len(), 1);
        assert!(honored.files[0].ends_with("kept.ts"));

        let included = scan_repository(dir.path(), true, 10_000);
        assert_eq!(included.files.len(), 2);
    }

    #[test]
    fn scan_enforces_the_hard_cap() {
        let dir = tempdir().unwrap();
        for i in 0..6 {
            fs::write(dir.path().join(format!("f{i}.py")), "def f(): pass").unwrap();
        }

        let outcome = scan_repository(dir.path(), false, 4);
        assert_eq!(outcome.files.len(), 4);
        assert!(outcome.truncated);
    }
}
