//! Passage types produced by retrieval.
//!
//! A [`SearchHit`] is what the vector search service returns; a
//! [`PassageCandidate`] is a hit attributed to the strategy that found it;
//! a [`FusedResult`] is the per-query aggregate after rank fusion.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The retrieval strategies that can contribute candidates.
///
/// The derived `Ord` is the canonical strategy order used whenever
/// per-strategy values must be combined deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyName {
    /// Embed the raw user text.
    Direct,
    /// Embed a model-drafted hypothetical answer.
    Hypothetical,
    /// Embed model-decomposed sub-questions.
    SubQuery,
}

impl StrategyName {
    pub const ALL: [StrategyName; 3] = [Self::Direct, Self::Hypothetical, Self::SubQuery];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Hypothetical => "hypothetical",
            Self::SubQuery => "sub_query",
        }
    }
}

impl std::fmt::Display for StrategyName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw nearest-neighbour hit from the vector search service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Similarity in [0, 1], higher is closer.
    pub similarity: f32,
}

/// A passage found by a single retrieval strategy. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassageCandidate {
    pub id: String,
    pub text: String,
    pub similarity: f32,
    #[serde(default)]
    pub source_metadata: Map<String, Value>,
    pub origin_strategy: StrategyName,
}

impl PassageCandidate {
    pub fn from_hit(hit: SearchHit, origin_strategy: StrategyName) -> Self {
        Self {
            id: hit.id,
            text: hit.text,
            similarity: hit.similarity,
            source_metadata: hit.metadata,
            origin_strategy,
        }
    }
}

/// One passage of the fused, ranked result set for a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub source_metadata: Map<String, Value>,
    /// 1-based position in the fused ranking.
    pub fused_rank: usize,
    /// Reciprocal-rank-fusion score.
    pub fused_score: f64,
    /// Highest raw similarity among the contributing candidates.
    pub best_similarity: f32,
    pub contributing_strategies: BTreeSet<StrategyName>,
}

impl FusedResult {
    /// Read a metadata field as a string, empty when absent.
    pub fn metadata_str(&self, key: &str) -> String {
        match self.source_metadata.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }
}
