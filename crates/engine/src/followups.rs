//! Follow-up question suggestions.

use std::sync::Arc;
use std::time::Duration;

use ciq_config::FollowupConfig;
use ciq_core::provider::{Provider, ProviderRequest};
use tracing::warn;

use crate::auxiliary::complete_json;
use crate::prompts::{FOLLOWUP_SYSTEM, followup_user_text, truncate_chars};

const ANSWER_EXCERPT_CHARS: usize = 1500;

pub struct FollowupGenerator {
    provider: Arc<dyn Provider>,
    model: String,
    config: FollowupConfig,
}

impl FollowupGenerator {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, config: FollowupConfig) -> Self {
        Self {
            provider,
            model: model.into(),
            config,
        }
    }

    /// Suggest follow-ups for a finished answer. Failure yields an empty list.
    pub async fn generate(&self, query: &str, answer: &str) -> Vec<String> {
        if !self.config.enabled || self.config.count == 0 {
            return Vec::new();
        }

        let excerpt = truncate_chars(answer, ANSWER_EXCERPT_CHARS);
        let request = ProviderRequest::simple(
            &self.model,
            FOLLOWUP_SYSTEM,
            followup_user_text(query, excerpt, self.config.count),
            0.5,
            512,
        );
        let deadline = Duration::from_millis(self.config.timeout_ms);

        match complete_json::<Vec<String>>(self.provider.as_ref(), request, deadline).await {
            Ok(questions) => questions
                .into_iter()
                .map(|q| q.trim().to_string())
                .filter(|q| !q.is_empty())
                .take(self.config.count)
                .collect(),
            Err(e) => {
                warn!(error = %e, "Follow-up generation failed");
                Vec::new()
            }
        }
    }
}
