//! Retrieval collaborators: the embedding client and the vector index.
//!
//! Both are consumed as black boxes. Implementations: an OpenAI-compatible
//! embedding client (`ciq-providers`) and an in-memory cosine index
//! (`ciq-store`); production deployments plug in their own vector database.

use async_trait::async_trait;

use crate::error::{ProviderError, RetrievalError};
use crate::filter::MetadataFilter;
use crate::passage::SearchHit;

/// Converts text into fixed-dimension vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// A human-readable name for this embedder.
    fn name(&self) -> &str;

    /// Embed a batch of texts, returning one vector per input in order.
    async fn embed(&self, inputs: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError>;

    /// Embed a single text.
    async fn embed_one(&self, input: &str) -> std::result::Result<Vec<f32>, ProviderError> {
        let mut vectors = self.embed(&[input.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            ProviderError::MalformedResponse("embedding response contained no vectors".into())
        })
    }
}

/// Top-k similarity search with pushed-down metadata filtering.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// The backend name (e.g., "in_memory").
    fn name(&self) -> &str;

    /// Return up to `top_k` nearest passages matching `filter`, most similar first.
    async fn search(
        &self,
        query_vector: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> std::result::Result<Vec<SearchHit>, RetrievalError>;
}
