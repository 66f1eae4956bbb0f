//! Local-document retrieval for strict-mode critic context.
//!
//! Strict learning mode gives the critic domain documentation without ever
//! exposing it to the executor (no test-time leakage). Retrieval is
//! deterministic and I/O-free outside the provided paths: paragraph-sized
//! chunks scored by lexical similarity plus a small tag bonus.

use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use crate::text::jaccard;

/// A local document exposed by a domain adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDoc {
    pub doc_id: String,
    pub title: String,
    pub path: PathBuf,
    pub tags: Vec<String>,
}

/// One retrieved chunk with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub source_id: String,
    pub source_path: String,
    pub source_title: String,
    pub text: String,
    pub score: f64,
}

/// Retrieval seam so tests can substitute a canned provider.
pub trait KnowledgeProvider {
    fn retrieve(&self, query: &str, docs: &[DomainDoc], max_chunks: usize) -> Vec<RetrievedChunk>;
}

/// Paragraph-chunking provider over local files.
#[derive(Debug, Clone)]
pub struct LocalDocsKnowledgeProvider {
    chunk_chars: usize,
}

impl Default for LocalDocsKnowledgeProvider {
    fn default() -> Self {
        LocalDocsKnowledgeProvider::new(900)
    }
}

impl LocalDocsKnowledgeProvider {
    #[must_use]
    pub fn new(chunk_chars: usize) -> Self {
        LocalDocsKnowledgeProvider {
            chunk_chars: chunk_chars.max(250),
        }
    }

    /// Chunk by paragraph-ish blocks so retrieved context preserves local
    /// syntax patterns (examples plus surrounding rules) without blowing the
    /// token budget.
    fn read_chunks(&self, path: &std::path::Path) -> Vec<String> {
        let Ok(text) = std::fs::read_to_string(path) else {
            return Vec::new();
        };
        let mut chunks: Vec<String> = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_len = 0usize;
        for line in text.lines() {
            let stripped = line.trim();
            if stripped.is_empty() {
                if !current.is_empty() {
                    chunks.push(current.join("\n"));
                    current.clear();
                    current_len = 0;
                }
                continue;
            }
            if current_len + stripped.len() > self.chunk_chars && !current.is_empty() {
                chunks.push(current.join("\n"));
                current = vec![stripped];
                current_len = stripped.len();
            } else {
                current.push(stripped);
                current_len += stripped.len() + 1;
            }
        }
        if !current.is_empty() {
            chunks.push(current.join("\n"));
        }
        chunks.retain(|chunk| !chunk.trim().is_empty());
        chunks
    }
}

impl KnowledgeProvider for LocalDocsKnowledgeProvider {
    fn retrieve(&self, query: &str, docs: &[DomainDoc], max_chunks: usize) -> Vec<RetrievedChunk> {
        let query = query.trim();
        if query.is_empty() {
            return Vec::new();
        }
        let query_lower = query.to_lowercase();
        let mut ranked: Vec<RetrievedChunk> = Vec::new();

        for doc in docs {
            let chunks = self.read_chunks(&doc.path);
            if chunks.is_empty() {
                continue;
            }
            let tag_hits = doc
                .tags
                .iter()
                .filter(|tag| query_lower.contains(&tag.to_lowercase()))
                .count();
            let tag_bonus = (0.05 * tag_hits as f64).min(0.25);
            for chunk in chunks {
                let score = jaccard(query, &chunk) + tag_bonus;
                if score <= 0.0 {
                    continue;
                }
                ranked.push(RetrievedChunk {
                    source_id: doc.doc_id.clone(),
                    source_path: doc.path.display().to_string(),
                    source_title: doc.title.clone(),
                    text: chunk,
                    score,
                });
            }
        }

        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(max_chunks.max(1));
        debug!(chunks = ranked.len(), "knowledge retrieval complete");
        ranked
    }
}
