//! Multi-strategy retrieval with reciprocal rank fusion.
//!
//! Each enabled strategy runs concurrently under its own timeout. A failed
//! or timed-out strategy contributes nothing and is reported; it never
//! aborts the others. Metadata filters are pushed into every similarity
//! search call.

pub mod fusion;
pub mod strategy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use ciq_config::RetrievalConfig;
use ciq_core::filter::MetadataFilter;
use ciq_core::passage::{FusedResult, PassageCandidate, StrategyName};
use ciq_core::provider::Provider;
use ciq_core::search::{Embedder, VectorSearch};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::QueryError;
pub use fusion::{RankedList, merge_ranked_lists, reciprocal_rank_fusion};

/// How a strategy ended for one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    Ok,
    Failed,
    TimedOut,
    Disabled,
}

/// Per-strategy outcome reported in query metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyReport {
    pub strategy: StrategyName,
    pub status: StrategyStatus,
    pub candidates: usize,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fused passages plus what each strategy did.
#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub results: Vec<FusedResult>,
    pub reports: Vec<StrategyReport>,
}

impl RetrievalOutcome {
    pub fn report(&self, strategy: StrategyName) -> Option<&StrategyReport> {
        self.reports.iter().find(|r| r.strategy == strategy)
    }
}

/// The Retriever. Holds no per-query state.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorSearch>,
    provider: Arc<dyn Provider>,
    auxiliary_model: String,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorSearch>,
        provider: Arc<dyn Provider>,
        auxiliary_model: impl Into<String>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            embedder,
            index,
            provider,
            auxiliary_model: auxiliary_model.into(),
            config,
        }
    }

    fn enabled(&self, strategy: StrategyName) -> bool {
        match strategy {
            StrategyName::Direct => self.config.direct,
            StrategyName::Hypothetical => self.config.hypothetical,
            StrategyName::SubQuery => self.config.sub_query,
        }
    }

    fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.config.strategy_timeout_ms)
    }

    /// Retrieve up to `result_count` fused passages. Never fails; zero results is valid.
    pub async fn retrieve(
        &self,
        query: &str,
        filter: Option<&MetadataFilter>,
        result_count: usize,
    ) -> RetrievalOutcome {
        let runs = join_all(
            StrategyName::ALL
                .into_iter()
                .map(|strategy| self.run_timed(strategy, query, filter)),
        )
        .await;

        let mut lists = Vec::new();
        let mut reports = Vec::new();
        for (report, candidates) in runs {
            if let Some(candidates) = candidates {
                lists.push(RankedList::new(report.strategy, candidates));
            }
            reports.push(report);
        }

        let results = reciprocal_rank_fusion(&lists, self.config.rrf_k, result_count);
        info!(
            strategies = lists.len(),
            passages = results.len(),
            "Retrieval complete"
        );
        RetrievalOutcome { results, reports }
    }

    async fn run_timed(
        &self,
        strategy: StrategyName,
        query: &str,
        filter: Option<&MetadataFilter>,
    ) -> (StrategyReport, Option<Vec<PassageCandidate>>) {
        let report = |status, candidates, elapsed_ms, error| StrategyReport {
            strategy,
            status,
            candidates,
            elapsed_ms,
            error,
        };

        if !self.enabled(strategy) {
            return (report(StrategyStatus::Disabled, 0, 0, None), None);
        }

        let started = Instant::now();
        let deadline = self.strategy_timeout();
        let outcome = tokio::time::timeout(deadline, self.run_strategy(strategy, query, filter)).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(candidates)) => {
                debug!(%strategy, candidates = candidates.len(), elapsed_ms, "Strategy finished");
                (
                    report(StrategyStatus::Ok, candidates.len(), elapsed_ms, None),
                    Some(candidates),
                )
            }
            Ok(Err(e)) => {
                warn!(%strategy, elapsed_ms, error = %e, "Retrieval strategy failed");
                let status = match &e {
                    QueryError::StrategyFailure { reason, .. } if reason.starts_with("timed out") => {
                        StrategyStatus::TimedOut
                    }
                    _ => StrategyStatus::Failed,
                };
                (report(status, 0, elapsed_ms, Some(e.to_string())), None)
            }
            Err(_) => {
                warn!(%strategy, elapsed_ms, "Retrieval strategy timed out");
                (
                    report(
                        StrategyStatus::TimedOut,
                        0,
                        elapsed_ms,
                        Some(format!("timed out after {}ms", deadline.as_millis())),
                    ),
                    None,
                )
            }
        }
    }

    async fn run_strategy(
        &self,
        strategy: StrategyName,
        query: &str,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<PassageCandidate>, QueryError> {
        let fail = |reason: String| QueryError::StrategyFailure { strategy, reason };
        let top_k = self.config.per_strategy_top_k;

        match strategy {
            StrategyName::Direct => {
                let vector = self.embedder.embed_one(query).await.map_err(|e| fail(e.to_string()))?;
                self.search(strategy, &vector, filter).await
            }
            StrategyName::Hypothetical => {
                let passage = strategy::hypothetical_passage(
                    self.provider.as_ref(),
                    &self.auxiliary_model,
                    query,
                    self.strategy_timeout(),
                )
                .await
                .map_err(|e| fail(e.to_string()))?;
                debug!(chars = passage.len(), "Hypothetical passage drafted");
                let vector = self.embedder.embed_one(&passage).await.map_err(|e| fail(e.to_string()))?;
                self.search(strategy, &vector, filter).await
            }
            StrategyName::SubQuery => {
                let subs = strategy::sub_queries(
                    self.provider.as_ref(),
                    &self.auxiliary_model,
                    query,
                    self.config.max_sub_queries,
                    self.strategy_timeout(),
                )
                .await
                .map_err(|e| fail(e.to_string()))?;
                if subs.is_empty() {
                    return Ok(Vec::new());
                }
                debug!(count = subs.len(), "Sub-queries generated");

                let vectors = self.embedder.embed(&subs).await.map_err(|e| fail(e.to_string()))?;
                if vectors.len() != subs.len() {
                    return Err(fail(format!(
                        "expected {} embeddings, got {}",
                        subs.len(),
                        vectors.len()
                    )));
                }

                let searches = join_all(vectors.iter().map(|v| self.search(strategy, v, filter))).await;
                let lists = searches.into_iter().collect::<Result<Vec<_>, _>>()?;
                let mut merged = merge_ranked_lists(lists);
                merged.truncate(top_k);
                Ok(merged)
            }
        }
    }

    async fn search(
        &self,
        strategy: StrategyName,
        vector: &[f32],
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<PassageCandidate>, QueryError> {
        let hits = self
            .index
            .search(vector, self.config.per_strategy_top_k, filter)
            .await
            .map_err(|e| QueryError::StrategyFailure {
                strategy,
                reason: e.to_string(),
            })?;
        Ok(hits
            .into_iter()
            .map(|hit| PassageCandidate::from_hit(hit, strategy))
            .collect())
    }
}
