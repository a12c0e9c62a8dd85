//! Query-level error taxonomy.

use ciq_core::error::ProviderError;
use ciq_core::passage::StrategyName;
use thiserror::Error;

use crate::context::AssemblyError;

/// Errors raised while answering one query.
///
/// Only [`QueryError::AssemblyImpossible`] and
/// [`QueryError::GenerationFailure`] reach the caller as a terminal
/// `error` event. Strategy and analysis failures are recorded and the query
/// continues; cancellation ends the stream without a terminal event.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{strategy} strategy failed: {reason}")]
    StrategyFailure { strategy: StrategyName, reason: String },

    #[error("Query analysis failed: {0}")]
    AnalysisFailure(String),

    #[error("Prompt assembly impossible: {0}")]
    AssemblyImpossible(#[from] AssemblyError),

    #[error("Generation failed: {0}")]
    GenerationFailure(#[from] ProviderError),

    #[error("Query cancelled by caller")]
    CancelledByCaller,
}

impl QueryError {
    /// Stable machine-readable kind, used as the `kind` of an error event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StrategyFailure { .. } => "strategy_failure",
            Self::AnalysisFailure(_) => "analysis_failure",
            Self::AssemblyImpossible(_) => "assembly_impossible",
            Self::GenerationFailure(ProviderError::Timeout(_)) => "generation_timeout",
            Self::GenerationFailure(_) => "generation_failure",
            Self::CancelledByCaller => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        let e = QueryError::GenerationFailure(ProviderError::StreamInterrupted("eof".into()));
        assert_eq!(e.kind(), "generation_failure");
        assert!(e.to_string().contains("eof"));

        let e = QueryError::GenerationFailure(ProviderError::Timeout("300s".into()));
        assert_eq!(e.kind(), "generation_timeout");

        let e = QueryError::StrategyFailure {
            strategy: StrategyName::SubQuery,
            reason: "bad json".into(),
        };
        assert_eq!(e.to_string(), "sub_query strategy failed: bad json");
    }
}
