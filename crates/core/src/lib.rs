//! # ciq Core
//!
//! Domain types, collaborator traits, and error definitions for the ciq
//! competitive-intelligence query engine. This crate performs **no I/O** —
//! it defines the model that the provider, store, and engine crates
//! implement against.
//!
//! ## Collaborators
//!
//! The engine talks to five external systems, each defined as a trait here:
//! - [`VectorSearch`] — top-k similarity search over the pre-built corpus
//! - [`Embedder`] — text to fixed-dimension vectors
//! - [`Provider`] — the language-model generation transport
//! - [`SessionStore`] — append-only conversation log per session
//! - [`ClientTool`] — a tool the model calls and this process executes

pub mod error;
pub mod filter;
pub mod message;
pub mod passage;
pub mod provider;
pub mod search;
pub mod session;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ProviderError, RetrievalError, SessionError};
pub use filter::{FilterField, MetadataFilter, QueryFilters};
pub use message::{Message, Role};
pub use passage::{FusedResult, PassageCandidate, SearchHit, StrategyName};
pub use provider::{
    CitationRef, DeltaReceiver, GenerationDelta, Provider, ProviderRequest, ProviderResponse, SourceDocument,
    Usage,
};
pub use search::{Embedder, VectorSearch};
pub use session::{ConversationTurn, SessionId, SessionStore, SessionSummary, TokenTotals};
pub use tool::{ClientTool, ToolCall, ToolOutput, ToolRound};
