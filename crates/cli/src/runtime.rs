//! Build the engine and its collaborators from configuration.

use std::sync::Arc;

use anyhow::{Context, bail};
use ciq_config::AppConfig;
use ciq_core::session::SessionStore;
use ciq_engine::QueryEngine;
use ciq_providers::{AnthropicProvider, OpenAiCompatEmbedder};
use ciq_store::{InMemoryIndex, InMemorySessionStore, MemoryDirectory, SqliteSessionStore};
use tracing::info;

pub fn load_config() -> anyhow::Result<AppConfig> {
    AppConfig::load().context("Failed to load config")
}

/// Open the configured session store.
pub async fn session_store(config: &AppConfig) -> anyhow::Result<Arc<dyn SessionStore>> {
    match config.sessions.backend.as_str() {
        "memory" => Ok(Arc::new(InMemorySessionStore::new())),
        _ => {
            let path = config.sessions.database_path();
            let store = SqliteSessionStore::open(&path)
                .await
                .with_context(|| format!("Failed to open session database {}", path.display()))?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn build_engine(config: &AppConfig, sessions: Option<Arc<dyn SessionStore>>) -> anyhow::Result<QueryEngine> {
    let Some(api_key) = config.api_key.as_deref() else {
        bail!("No generation API key: set ANTHROPIC_API_KEY or CIQ_API_KEY");
    };
    let mut provider = AnthropicProvider::new(api_key)?.with_thinking_budget(config.generation.thinking_budget_tokens);
    if let Some(base_url) = &config.generation.base_url {
        provider = provider.with_base_url(base_url);
    }

    let Some(embedding_key) = config.embedding.api_key.as_deref() else {
        bail!("No embedding API key: set OPENAI_API_KEY or CIQ_EMBEDDING_API_KEY");
    };
    let embedder = OpenAiCompatEmbedder::new(
        "embeddings",
        &config.embedding.api_url,
        embedding_key,
        &config.embedding.model,
    )?;

    let Some(corpus_path) = config.corpus.path.as_deref() else {
        bail!("No corpus configured: set corpus.path or CIQ_CORPUS");
    };
    let index = InMemoryIndex::from_jsonl(corpus_path)
        .with_context(|| format!("Failed to load corpus {}", corpus_path.display()))?;
    info!(passages = index.len(), dimension = index.dimension(), "Corpus loaded");

    let mut engine = QueryEngine::new(
        config,
        Arc::new(provider),
        Arc::new(embedder),
        Arc::new(index),
        sessions,
    );
    if config.memory.enabled {
        let root = config.memory.root();
        info!(root = %root.display(), "Memory tool enabled");
        let memory = MemoryDirectory::new(root).with_limits(config.memory.max_files, config.memory.max_file_chars);
        engine = engine.with_memory_tool(Arc::new(memory), config.memory.max_rounds);
    }
    Ok(engine)
}
