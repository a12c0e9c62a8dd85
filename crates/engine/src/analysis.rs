//! Lightweight query classification.
//!
//! The analysis only informs filter defaults; any failure degrades to the
//! default analysis and an unfiltered retrieval.

use std::sync::Arc;
use std::time::Duration;

use ciq_config::AnalysisConfig;
use ciq_core::filter::QueryFilters;
use ciq_core::provider::{Provider, ProviderRequest};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auxiliary::complete_json;
use crate::error::QueryError;
use crate::prompts::{ANALYSIS_SYSTEM, analysis_user_text};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryIntent {
    Comparison,
    Factual,
    ObjectionHandling,
    /// Also the reading of any intent label the classifier invents.
    #[default]
    #[serde(other)]
    Exploratory,
}

/// What the classifier detected in the query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryAnalysis {
    pub intent: QueryIntent,
    pub competitors_mentioned: Vec<String>,
    pub topics: Vec<String>,
    pub source_type_hints: Vec<String>,
    pub reasoning: String,
}

impl QueryAnalysis {
    /// The analysis used when classification is off or failed.
    pub fn fallback(reasoning: impl Into<String>) -> Self {
        Self {
            reasoning: reasoning.into(),
            ..Default::default()
        }
    }

    fn normalized(mut self) -> Self {
        for list in [
            &mut self.competitors_mentioned,
            &mut self.topics,
            &mut self.source_type_hints,
        ] {
            let mut seen = Vec::with_capacity(list.len());
            for item in list.drain(..) {
                let item = item.trim().to_lowercase();
                if !item.is_empty() && !seen.contains(&item) {
                    seen.push(item);
                }
            }
            *list = seen;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Ok,
    Failed,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutcome {
    pub status: AnalysisStatus,
    pub analysis: QueryAnalysis,
}

/// Classifies queries with the auxiliary model.
pub struct QueryAnalyzer {
    provider: Arc<dyn Provider>,
    model: String,
    config: AnalysisConfig,
}

impl QueryAnalyzer {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, config: AnalysisConfig) -> Self {
        Self {
            provider,
            model: model.into(),
            config,
        }
    }

    pub async fn analyze(&self, query: &str) -> AnalysisOutcome {
        if !self.config.enabled {
            return AnalysisOutcome {
                status: AnalysisStatus::Disabled,
                analysis: QueryAnalysis::fallback("Analysis disabled"),
            };
        }

        match self.classify(query).await {
            Ok(analysis) => {
                debug!(
                    intent = ?analysis.intent,
                    competitors = ?analysis.competitors_mentioned,
                    "Query analyzed"
                );
                AnalysisOutcome {
                    status: AnalysisStatus::Ok,
                    analysis,
                }
            }
            Err(e) => {
                warn!(error = %e, "Query analysis failed, using default analysis");
                AnalysisOutcome {
                    status: AnalysisStatus::Failed,
                    analysis: QueryAnalysis::fallback("Analysis failed, using original query"),
                }
            }
        }
    }

    async fn classify(&self, query: &str) -> Result<QueryAnalysis, QueryError> {
        let request = ProviderRequest::simple(&self.model, ANALYSIS_SYSTEM, analysis_user_text(query), 0.1, 1024);
        let deadline = Duration::from_millis(self.config.timeout_ms);
        let analysis: QueryAnalysis = complete_json(self.provider.as_ref(), request, deadline)
            .await
            .map_err(|e| QueryError::AnalysisFailure(e.to_string()))?;
        Ok(analysis.normalized())
    }

    /// Filters for retrieval after applying detected defaults.
    ///
    /// Detected competitors become the competitor filter only when the
    /// caller supplied none.
    pub fn effective_filters(&self, requested: &QueryFilters, analysis: &QueryAnalysis) -> QueryFilters {
        let mut filters = requested.clone();
        if self.config.apply_detected_filters
            && filters.competitors.is_empty()
            && !analysis.competitors_mentioned.is_empty()
        {
            filters.competitors = analysis.competitors_mentioned.clone();
        }
        filters
    }
}
