//! Prompt context: token estimation, history compaction and prompt assembly.
//!
//! | Layer | Source | Trim strategy |
//! |-------|--------|---------------|
//! | System | Synthesis instructions + modifiers | Never trimmed |
//! | History | Session store | Oldest turns dropped, most recent always kept |
//! | Passages | Retriever | Lowest-ranked dropped |
//! | User text | Request | Never trimmed |

pub mod assembler;
pub mod history;
pub mod token;

pub use assembler::{AssemblyError, AssemblyInput, DropInfo, PlanStats, PromptAssembler, PromptPlan};
pub use history::{CompactedHistory, HistoryCompactor};
pub use token::{TokenEstimator, estimate_tokens};
