//! # ciq Engine
//!
//! The retrieval-fusion and streaming-orchestration core:
//! - [`retriever`] — direct, hypothetical-document and sub-query strategies
//!   fused with reciprocal rank fusion
//! - [`context`] — token estimation, history compaction, prompt assembly
//! - [`orchestrator`] — the per-query state machine that drives generation
//!   and emits the ordered [`StreamEvent`] sequence
//! - [`citations`], [`analysis`], [`followups`] — the supporting steps

pub mod analysis;
pub mod auxiliary;
pub mod citations;
pub mod context;
pub mod error;
pub mod followups;
pub mod orchestrator;
pub mod prompts;
pub mod retriever;
pub mod stream_event;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use analysis::{AnalysisStatus, QueryAnalysis, QueryAnalyzer, QueryIntent};
pub use citations::{CitationSource, CitationTracker};
pub use context::{
    AssemblyError, CompactedHistory, HistoryCompactor, PlanStats, PromptAssembler, PromptPlan, TokenEstimator,
};
pub use error::QueryError;
pub use orchestrator::{Phase, QueryEngine, QueryHandle, QueryRequest};
pub use retriever::{RetrievalOutcome, Retriever, StrategyReport, StrategyStatus};
pub use stream_event::{PhaseTimings, QueryMetadata, StatusStep, StreamEvent};
