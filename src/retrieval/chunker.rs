//! Markdown corpus loading
//!
//! Documents are split into fixed-size character chunks with stable ids
//! of the form `{file_stem}::chunk{index}`. Those ids double as citation
//! strings in final answers, so chunking must stay deterministic across
//! runs and platforms.

use std::path::Path;

use tracing::{info, warn};

use crate::error::{CopilotError, Result};

#[derive(Debug, Clone)]
pub struct DocChunk {
    pub id: String,
    pub source: String,
    pub chunk_index: usize,
    pub text: String,
}

/// Load every `.md` file under `dir` and chunk it.
pub fn load_chunks(dir: &Path, chunk_size: usize) -> Result<Vec<DocChunk>> {
    if !dir.is_dir() {
        return Err(CopilotError::Retrieval(format!(
            "document directory not found: {}",
            dir.display()
        )));
    }

    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) == Some("md") {
            paths.push(path);
        }
    }
    // read_dir order is platform dependent
    paths.sort();

    let mut chunks = Vec::new();
    for path in &paths {
        let text = std::fs::read_to_string(path)?;
        let stem = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("doc");
        chunks.extend(chunk_text(stem, &text, chunk_size));
    }

    if chunks.is_empty() {
        warn!("No markdown content found under {}", dir.display());
    } else {
        info!(
            "Loaded {} chunks from {} documents",
            chunks.len(),
            paths.len()
        );
    }
    Ok(chunks)
}

/// Split one document into character chunks.
pub fn chunk_text(source: &str, text: &str, chunk_size: usize) -> Vec<DocChunk> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(chunk_size.max(1))
        .enumerate()
        .map(|(index, window)| DocChunk {
            id: format!("{}::chunk{}", source, index),
            source: source.to_string(),
            chunk_index: index,
            text: window.iter().collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ids_and_boundaries() {
        println!("🧪 Testing chunk id assignment...");
        let text = "a".repeat(650);
        let chunks = chunk_text("policy", &text, 300);

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].id, "policy::chunk0");
        assert_eq!(chunks[2].id, "policy::chunk2");
        assert_eq!(chunks[0].text.len(), 300);
        assert_eq!(chunks[2].text.len(), 50);
        println!("✅ {} chunks with stable ids", chunks.len());
    }

    #[test]
    fn test_empty_document_yields_no_chunks() {
        let chunks = chunk_text("empty", "", 300);
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_load_chunks_sorts_files() -> std::result::Result<(), Box<dyn std::error::Error>> {
        println!("🧪 Testing corpus loading order...");
        let dir = std::env::temp_dir().join(format!("corpus_{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("zebra.md"), "zebra facts")?;
        std::fs::write(dir.join("alpha.md"), "alpha facts")?;
        std::fs::write(dir.join("notes.txt"), "ignored")?;

        let chunks = load_chunks(&dir, 300)?;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source, "alpha");
        assert_eq!(chunks[1].source, "zebra");

        std::fs::remove_dir_all(&dir)?;
        println!("✅ Corpus loaded in sorted file order");
        Ok(())
    }
}
