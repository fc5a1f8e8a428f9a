//! The immutable build specification.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Immutable input describing the desired project.
#[derive(Debug, Clone)]
pub struct BuildSpecification {
    source_path: PathBuf,
    raw_text: String,
    hash: String,
}

impl BuildSpecification {
    /// Load a specification from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw_text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read spec file: {}", path.display()))?;
        let source_path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        Ok(Self::from_text(source_path, raw_text))
    }

    pub fn from_text(source_path: impl Into<PathBuf>, raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        let hash = compute_spec_hash(&raw_text);
        Self {
            source_path: source_path.into(),
            raw_text,
            hash,
        }
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    /// SHA-256 hex digest of the raw text.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Project name: the first markdown heading, else the file stem.
    pub fn project_name(&self) -> String {
        self.raw_text
            .lines()
            .map(str::trim)
            .find_map(|line| line.strip_prefix('#'))
            .map(|heading| heading.trim_start_matches('#').trim().to_string())
            .filter(|heading| !heading.is_empty())
            .or_else(|| {
                self.source_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "project".to_string())
    }
}

/// Compute the SHA-256 hash of specification content.
pub fn compute_spec_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_hash_is_stable_and_content_sensitive() {
        let a = compute_spec_hash("# App\nbuild it");
        let b = compute_spec_hash("# App\nbuild it");
        let c = compute_spec_hash("# App\nbuild it!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_load_reads_file_and_hashes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("spec.md");
        std::fs::write(&path, "# Todo Service\n\nA REST API.").unwrap();

        let spec = BuildSpecification::load(&path).unwrap();
        assert_eq!(spec.raw_text(), "# Todo Service\n\nA REST API.");
        assert_eq!(spec.hash(), compute_spec_hash("# Todo Service\n\nA REST API."));
        assert_eq!(spec.project_name(), "Todo Service");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let dir = tempdir().unwrap();
        let err = BuildSpecification::load(&dir.path().join("missing.md")).unwrap_err();
        assert!(err.to_string().contains("Failed to read spec file"));
    }

    #[test]
    fn test_project_name_falls_back_to_file_stem() {
        let spec = BuildSpecification::from_text("/tmp/inventory.md", "no headings here");
        assert_eq!(spec.project_name(), "inventory");
    }
}
