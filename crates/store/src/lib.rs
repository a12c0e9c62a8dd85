//! Storage implementations for ciq.
//!
//! - Session stores: in-memory and SQLite (behind the default `sqlite` feature)
//! - An in-memory cosine-similarity index over a pre-built corpus
//! - Per-owner memory files behind the model's `memory` tool

pub mod in_memory;
pub mod memory_files;
pub mod vector;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemorySessionStore;
pub use memory_files::{MEMORY_TOOL_NAME, MemoryDirectory};
pub use vector::{CorpusEntry, InMemoryIndex, cosine_similarity};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteSessionStore;
