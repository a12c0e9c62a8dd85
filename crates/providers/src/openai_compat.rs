//! OpenAI-compatible embedding client.
//!
//! Works with: OpenAI, Azure-style proxies, Ollama, vLLM, Together AI and
//! any endpoint exposing `POST {base_url}/embeddings`.

use async_trait::async_trait;
use ciq_core::error::ProviderError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An OpenAI-compatible embedding client.
pub struct OpenAiCompatEmbedder {
    name: String,
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatEmbedder {
    /// Create a new OpenAI-compatible embedder.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Create an OpenAI embedder (convenience constructor).
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::new("openai", "https://api.openai.com/v1", api_key, model)
    }

    /// The embedding model requested.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Restore input order from the `index` field and check the count.
    fn into_vectors(
        api_resp: EmbeddingApiResponse,
        expected: usize,
    ) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut data = api_resp.data;
        data.sort_by_key(|d| d.index);
        if data.len() != expected {
            return Err(ProviderError::MalformedResponse(format!(
                "expected {expected} embeddings, got {}",
                data.len()
            )));
        }
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[async_trait]
impl ciq_core::Embedder for OpenAiCompatEmbedder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, inputs: &[String]) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/embeddings", self.base_url);

        let body = EmbeddingApiRequest {
            model: &self.model,
            input: inputs,
            encoding_format: "float",
        };

        debug!(
            provider = %self.name,
            model = %self.model,
            count = inputs.len(),
            "Sending embedding request"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            });
        }
        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid embedding API key".into(),
            ));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let api_resp: EmbeddingApiResponse = response.json().await.map_err(|e| {
            ProviderError::MalformedResponse(format!("Failed to parse embedding response: {e}"))
        })?;

        if let Some(usage) = &api_resp.usage {
            debug!(prompt_tokens = usage.prompt_tokens, "Embedding usage");
        }

        Self::into_vectors(api_resp, inputs.len())
    }
}

// --- Embedding API types ---

#[derive(Debug, Serialize)]
struct EmbeddingApiRequest<'a> {
    model: &'a str,
    input: &'a [String],
    encoding_format: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Option<EmbeddingApiUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiUsage {
    prompt_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciq_core::Embedder;

    #[test]
    fn openai_constructor() {
        let e = OpenAiCompatEmbedder::openai("sk-test", "text-embedding-3-small").unwrap();
        assert_eq!(e.name(), "openai");
        assert_eq!(e.base_url, "https://api.openai.com/v1");
        assert_eq!(e.model(), "text-embedding-3-small");
    }

    #[test]
    fn trailing_slash_trimmed() {
        let e = OpenAiCompatEmbedder::new("local", "http://localhost:11434/v1/", "x", "nomic").unwrap();
        assert_eq!(e.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn request_serialization() {
        let inputs = vec!["hello world".to_string(), "how are you".to_string()];
        let req = EmbeddingApiRequest {
            model: "text-embedding-3-small",
            input: &inputs,
            encoding_format: "float",
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["input"][1], "how are you");
        assert_eq!(json["encoding_format"], "float");
    }

    #[test]
    fn vectors_follow_index_order() {
        let data = r#"{
            "data": [
                {"embedding": [0.4, 0.5, 0.6], "index": 1},
                {"embedding": [0.1, 0.2, 0.3], "index": 0}
            ],
            "model": "text-embedding-3-small",
            "usage": {"prompt_tokens": 8, "total_tokens": 8}
        }"#;
        let parsed: EmbeddingApiResponse = serde_json::from_str(data).unwrap();
        let vectors = OpenAiCompatEmbedder::into_vectors(parsed, 2).unwrap();
        assert_eq!(vectors[0], vec![0.1, 0.2, 0.3]);
        assert_eq!(vectors[1], vec![0.4, 0.5, 0.6]);
    }

    #[test]
    fn count_mismatch_is_malformed() {
        let parsed: EmbeddingApiResponse =
            serde_json::from_str(r#"{"data": [{"embedding": [0.1], "index": 0}]}"#).unwrap();
        let err = OpenAiCompatEmbedder::into_vectors(parsed, 2).unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn empty_batch_skips_request() {
        let e = OpenAiCompatEmbedder::new("offline", "http://127.0.0.1:9", "x", "m").unwrap();
        assert!(e.embed(&[]).await.unwrap().is_empty());
    }
}
