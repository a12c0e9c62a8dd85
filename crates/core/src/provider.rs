//! Provider trait — the abstraction over the language-model transport.
//!
//! A Provider turns a [`ProviderRequest`] into either a complete response or
//! an incremental stream of [`GenerationDelta`]s. Vendor wire formats are
//! translated into deltas inside the provider crate, so the engine never
//! sees provider-native event types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::Message;
use crate::tool::{ToolCall, ToolRound};

/// A retrieved passage handed to the model as a citable document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    /// Stable locator (URL, or `vectordb://<id>` when none is known).
    pub source: String,
    /// Display title, including provenance hints.
    pub title: String,
    /// The passage text.
    pub text: String,
}

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "claude-sonnet-4-6")
    pub model: String,

    /// System instructions
    #[serde(default)]
    pub system: String,

    /// Prior turns followed by the current user message
    pub messages: Vec<Message>,

    /// Documents attached to the final user message for grounded citation
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub documents: Vec<SourceDocument>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// Enable extended reasoning for this request
    #[serde(default)]
    pub reasoning: bool,

    /// Attach the server-side web search tool
    #[serde(default)]
    pub web_search: bool,

    /// Offer the client-side memory tool
    #[serde(default)]
    pub memory_tool: bool,

    /// Earlier turns of this generation that ended in client tool calls
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_rounds: Vec<ToolRound>,
}

fn default_temperature() -> f32 {
    0.15
}

impl ProviderRequest {
    /// A plain single-turn request, as used for auxiliary calls.
    pub fn simple(
        model: impl Into<String>,
        system: impl Into<String>,
        user: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
    ) -> Self {
        Self {
            model: model.into(),
            system: system.into(),
            messages: vec![Message::user(user)],
            documents: Vec::new(),
            temperature,
            max_tokens,
            reasoning: false,
            web_search: false,
            memory_tool: false,
            tool_rounds: Vec::new(),
        }
    }
}

/// A complete (non-streaming) response from a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// The generated text (text blocks concatenated)
    pub text: String,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,

    /// Why generation stopped, when the provider reports it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl Usage {
    /// Fold a later usage report into this one.
    ///
    /// Providers report cumulative counters, so non-zero fields of the later
    /// report replace earlier values rather than adding to them.
    pub fn merge(&mut self, later: &Usage) {
        fn take(slot: &mut u64, v: u64) {
            if v > 0 {
                *slot = v;
            }
        }
        take(&mut self.prompt_tokens, later.prompt_tokens);
        take(&mut self.completion_tokens, later.completion_tokens);
        take(&mut self.cache_creation_tokens, later.cache_creation_tokens);
        take(&mut self.cache_read_tokens, later.cache_read_tokens);
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }

    /// Add the usage of a separate request, as when generation continues
    /// after a tool round.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }
}

/// A citation reported inline with generated text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationRef {
    /// 0-based index into the request's `documents`, when the provider knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub cited_text: String,
}

/// One provider-neutral increment of streamed generation output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GenerationDelta {
    /// Extended-reasoning text.
    Thinking { text: String },
    /// Answer text.
    Text { text: String },
    /// A citation attached to the answer text that precedes it.
    Citation { citation: CitationRef },
    /// The model started invoking a tool.
    ToolUseStart { id: String, name: String },
    /// A client tool call is complete and awaits local execution.
    ToolCall { call: ToolCall },
    /// A tool invocation finished with a result.
    ToolResult {
        tool_use_id: String,
        name: String,
        content: serde_json::Value,
    },
    /// Cumulative usage counters.
    Usage { usage: Usage },
    /// Generation finished.
    Stop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// The receiving half of a generation stream.
pub type DeltaReceiver = mpsc::Receiver<std::result::Result<GenerationDelta, ProviderError>>;

/// The core Provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "anthropic").
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn complete(
        &self,
        request: ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Send a request and get a stream of deltas.
    ///
    /// Cancelling `cancel` must abort the underlying call, not merely stop
    /// delivering deltas. The stream ends after a `Stop` delta or an error.
    ///
    /// Default implementation calls `complete()` and replays the result.
    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<DeltaReceiver, ProviderError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            r = self.complete(request) => r?,
        };
        let (tx, rx) = mpsc::channel(3);
        let _ = tx
            .send(Ok(GenerationDelta::Text {
                text: response.text,
            }))
            .await;
        if let Some(usage) = response.usage {
            let _ = tx.send(Ok(GenerationDelta::Usage { usage })).await;
        }
        let _ = tx
            .send(Ok(GenerationDelta::Stop {
                reason: response.stop_reason,
            }))
            .await;
        Ok(rx)
    }
}
