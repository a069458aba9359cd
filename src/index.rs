//! Semantic index file loading.
//!
//! A load failure is logged and turned into
//! [`IndexHandle::Unavailable`]; the process keeps running and every
//! retrieval fails with `IndexUnavailable` until the file is fixed.

use std::path::Path;

use anyhow::{Context, Result};
use qa_harness_core::index::{IndexFile, IndexHandle, SemanticIndex};
use tracing::{info, warn};

use crate::config::Config;

/// Read and validate an index file.
pub fn read_index(path: &Path) -> Result<SemanticIndex> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read index file: {}", path.display()))?;
    let file: IndexFile = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse index file: {}", path.display()))?;
    Ok(SemanticIndex::from_file(file)?)
}

/// Load the index without failing startup.
pub fn load_index(path: &Path) -> IndexHandle {
    match read_index(path) {
        Ok(index) => {
            info!(
                path = %path.display(),
                chunks = index.len(),
                dims = index.dims(),
                metric = index.metric().as_str(),
                "semantic index loaded"
            );
            IndexHandle::Loaded(index.into())
        }
        Err(e) => {
            let reason = format!("{:#}", e);
            warn!(path = %path.display(), %reason, "semantic index unavailable");
            IndexHandle::Unavailable(reason)
        }
    }
}

/// `qa index`: print what the configured index file contains.
pub fn run_index_info(config: &Config) -> Result<()> {
    let path = &config.index.path;
    let index = read_index(path)?;

    println!("Index: {}", path.display());
    println!("  model:       {}", index.model());
    println!("  dims:        {}", index.dims());
    println!("  metric:      {}", index.metric().as_str());
    println!("  chunks:      {}", index.len());
    println!("  fingerprint: {}", index.fingerprint());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let handle = load_index(&dir.path().join("absent.json"));
        assert!(!handle.is_loaded());
    }

    #[test]
    fn test_valid_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        let doc = json!({
            "model": "test",
            "dims": 2,
            "chunks": [
                { "id": "a", "text": "alpha", "embedding": [1.0, 0.0], "source_offset": 0 },
                { "id": "b", "text": "beta", "embedding": [0.0, 1.0], "source_offset": 6 }
            ]
        });
        std::fs::write(&path, doc.to_string()).unwrap();

        let handle = load_index(&path);
        let index = handle.get().unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.metric().as_str(), "cosine");
    }

    #[test]
    fn test_malformed_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.json");
        std::fs::write(&path, "{ not json").unwrap();
        match load_index(&path) {
            IndexHandle::Unavailable(reason) => assert!(reason.contains("parse")),
            IndexHandle::Loaded(_) => panic!("malformed index should not load"),
        }
    }
}
