//! Short, bounded auxiliary model calls (analysis, HyDE, sub-queries, follow-ups).

use std::time::Duration;

use ciq_core::error::ProviderError;
use ciq_core::provider::{Provider, ProviderRequest};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::prompts::strip_code_fences;

#[derive(Debug, Error)]
pub enum AuxiliaryError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("malformed reply: {0}")]
    Malformed(String),
}

impl AuxiliaryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut(_) | Self::Provider(ProviderError::Timeout(_)))
    }
}

/// Run a non-streaming completion under a deadline and return its text.
pub async fn complete_text(
    provider: &dyn Provider,
    request: ProviderRequest,
    deadline: Duration,
) -> Result<String, AuxiliaryError> {
    let response = tokio::time::timeout(deadline, provider.complete(request))
        .await
        .map_err(|_| AuxiliaryError::TimedOut(deadline))??;
    Ok(response.text)
}

/// Run a completion and parse its reply as JSON, tolerating code fences.
pub async fn complete_json<T: DeserializeOwned>(
    provider: &dyn Provider,
    request: ProviderRequest,
    deadline: Duration,
) -> Result<T, AuxiliaryError> {
    let text = complete_text(provider, request, deadline).await?;
    parse_json_reply(&text)
}

pub fn parse_json_reply<T: DeserializeOwned>(raw: &str) -> Result<T, AuxiliaryError> {
    serde_json::from_str(strip_code_fences(raw)).map_err(|e| AuxiliaryError::Malformed(e.to_string()))
}
