//! Collaborator transports for ciq.
//!
//! The generation transport implements `ciq_core::Provider`; the embedding
//! client implements `ciq_core::Embedder`.

pub mod anthropic;
pub mod openai_compat;

pub use anthropic::{AnthropicProvider, AnthropicStreamDecoder};
pub use openai_compat::OpenAiCompatEmbedder;
