//! In-memory vector index over a pre-built corpus.
//!
//! Exact (brute-force) cosine similarity with metadata filters evaluated
//! before ranking, so a filter never shrinks the top-k window.

use async_trait::async_trait;
use ciq_core::error::RetrievalError;
use ciq_core::filter::MetadataFilter;
use ciq_core::passage::SearchHit;
use ciq_core::search::VectorSearch;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::BufRead;
use std::path::Path;
use tracing::info;

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if the lengths differ or either vector is empty or zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// One line of a JSONL corpus file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub embedding: Vec<f32>,
}

/// A brute-force cosine index held entirely in memory.
pub struct InMemoryIndex {
    entries: Vec<CorpusEntry>,
    dimension: usize,
}

impl InMemoryIndex {
    /// Build an index, checking every embedding has the same dimension.
    pub fn new(entries: Vec<CorpusEntry>) -> Result<Self, RetrievalError> {
        let dimension = entries.first().map(|e| e.embedding.len()).unwrap_or(0);
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dimension) {
            return Err(RetrievalError::Corpus(format!(
                "entry '{}' has dimension {}, expected {dimension}",
                bad.id,
                bad.embedding.len()
            )));
        }
        Ok(Self { entries, dimension })
    }

    /// Load a JSONL corpus: one [`CorpusEntry`] per non-blank line.
    pub fn from_jsonl(path: &Path) -> Result<Self, RetrievalError> {
        let file = std::fs::File::open(path)
            .map_err(|e| RetrievalError::Corpus(format!("{}: {e}", path.display())))?;

        let mut entries = Vec::new();
        for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| RetrievalError::Corpus(format!("{}: {e}", path.display())))?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: CorpusEntry = serde_json::from_str(&line).map_err(|e| {
                RetrievalError::Corpus(format!("{}:{}: {e}", path.display(), lineno + 1))
            })?;
            entries.push(entry);
        }

        let index = Self::new(entries)?;
        info!(
            passages = index.len(),
            dimension = index.dimension,
            "Loaded corpus from {}",
            path.display()
        );
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

#[async_trait]
impl VectorSearch for InMemoryIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchHit>, RetrievalError> {
        if self.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        if query_vector.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: query_vector.len(),
            });
        }

        let mut scored: Vec<(f32, &CorpusEntry)> = self
            .entries
            .iter()
            .filter(|e| filter.is_none_or(|f| f.matches(&e.metadata)))
            .map(|e| (cosine_similarity(&e.embedding, query_vector).clamp(0.0, 1.0), e))
            .collect();

        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.id.cmp(&b.1.id)));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(similarity, e)| SearchHit {
                id: e.id.clone(),
                text: e.text.clone(),
                metadata: e.metadata.clone(),
                similarity,
            })
            .collect())
    }
}
