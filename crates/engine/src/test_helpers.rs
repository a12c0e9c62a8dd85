//! Shared test helpers: scripted collaborators and a small corpus.
//!
//! Also compiled into the integration tests via `#[path]`, so only
//! external crate paths are used here.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ciq_core::error::{ProviderError, SessionError};
use ciq_core::passage::{FusedResult, StrategyName};
use ciq_core::provider::{
    CitationRef, DeltaReceiver, GenerationDelta, Provider, ProviderRequest, ProviderResponse, Usage,
};
use ciq_core::search::Embedder;
use ciq_core::session::{ConversationTurn, SessionId, SessionStore, SessionSummary, TokenTotals};
use ciq_core::tool::{ClientTool, ToolCall};
use ciq_store::{CorpusEntry, InMemoryIndex, InMemorySessionStore};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

enum Reply {
    Text { text: String, delay: Duration },
    Fail(ProviderError),
}

#[derive(Clone)]
struct StreamScript {
    deltas: Vec<Result<GenerationDelta, ProviderError>>,
    delay: Duration,
    hang: bool,
}

/// A provider whose replies are keyed by the request's system text.
///
/// `complete` answers auxiliary calls; `stream` plays back the scripted
/// generation deltas, one scripted round per call before the fallback
/// script. Unscripted calls fail with `NotConfigured`.
pub struct ScriptedProvider {
    replies: Vec<(String, Reply)>,
    rounds: Mutex<VecDeque<StreamScript>>,
    stream: Option<StreamScript>,
    requests: Mutex<Vec<ProviderRequest>>,
    stream_requests: Mutex<Vec<ProviderRequest>>,
    stream_cancelled: Arc<AtomicBool>,
    cancelled_notify: Arc<Notify>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            replies: Vec::new(),
            rounds: Mutex::new(VecDeque::new()),
            stream: None,
            requests: Mutex::new(Vec::new()),
            stream_requests: Mutex::new(Vec::new()),
            stream_cancelled: Arc::new(AtomicBool::new(false)),
            cancelled_notify: Arc::new(Notify::new()),
        }
    }

    pub fn reply(self, system: &str, text: &str) -> Self {
        self.reply_after(system, text, Duration::ZERO)
    }

    pub fn reply_after(mut self, system: &str, text: &str, delay: Duration) -> Self {
        self.replies.push((
            system.to_string(),
            Reply::Text {
                text: text.to_string(),
                delay,
            },
        ));
        self
    }

    pub fn fail(mut self, system: &str, error: ProviderError) -> Self {
        self.replies.push((system.to_string(), Reply::Fail(error)));
        self
    }

    pub fn stream(mut self, deltas: Vec<Result<GenerationDelta, ProviderError>>) -> Self {
        self.stream = Some(StreamScript {
            deltas,
            delay: Duration::ZERO,
            hang: false,
        });
        self
    }

    /// Answer successive generation calls with successive scripts.
    pub fn stream_rounds(self, rounds: Vec<Vec<Result<GenerationDelta, ProviderError>>>) -> Self {
        self.rounds.lock().unwrap().extend(rounds.into_iter().map(|deltas| StreamScript {
            deltas,
            delay: Duration::ZERO,
            hang: false,
        }));
        self
    }

    /// Play the deltas with a pause before each one.
    pub fn stream_slowly(mut self, deltas: Vec<Result<GenerationDelta, ProviderError>>, delay: Duration) -> Self {
        self.stream = Some(StreamScript {
            deltas,
            delay,
            hang: false,
        });
        self
    }

    /// Play the deltas, then keep the call open until it is cancelled.
    pub fn stream_then_hang(mut self, deltas: Vec<Result<GenerationDelta, ProviderError>>) -> Self {
        self.stream = Some(StreamScript {
            deltas,
            delay: Duration::ZERO,
            hang: true,
        });
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn stream_requests(&self) -> Vec<ProviderRequest> {
        self.stream_requests.lock().unwrap().clone()
    }

    pub fn stream_was_cancelled(&self) -> bool {
        self.stream_cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once a generation call has observed cancellation.
    pub async fn wait_stream_cancelled(&self) {
        loop {
            let notified = self.cancelled_notify.notified();
            if self.stream_was_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.replies.iter().find(|(system, _)| *system == request.system);
        match reply {
            Some((_, Reply::Text { text, delay })) => {
                if !delay.is_zero() {
                    tokio::time::sleep(*delay).await;
                }
                Ok(ProviderResponse {
                    text: text.clone(),
                    usage: None,
                    model: request.model,
                    stop_reason: Some("end_turn".into()),
                })
            }
            Some((_, Reply::Fail(e))) => Err(e.clone()),
            None => Err(ProviderError::NotConfigured("no scripted reply".into())),
        }
    }

    async fn stream(
        &self,
        request: ProviderRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaReceiver, ProviderError> {
        self.stream_requests.lock().unwrap().push(request);
        let next_round = self.rounds.lock().unwrap().pop_front();
        let Some(script) = next_round.or_else(|| self.stream.clone()) else {
            return Err(ProviderError::NotConfigured("no scripted stream".into()));
        };

        let (tx, rx) = mpsc::channel(16);
        let cancelled = self.stream_cancelled.clone();
        let notify = self.cancelled_notify.clone();
        let mark = move || {
            cancelled.store(true, Ordering::SeqCst);
            notify.notify_waiters();
        };

        tokio::spawn(async move {
            for delta in script.deltas {
                if !script.delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            mark();
                            return;
                        }
                        _ = tokio::time::sleep(script.delay) => {}
                    }
                }
                if tx.send(delta).await.is_err() {
                    return;
                }
            }
            if script.hang {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => mark(),
                    _ = tx.closed() => {}
                }
            }
        });
        Ok(rx)
    }
}

/// Text split into word deltas, then usage and a stop.
pub fn answer_stream(text: &str) -> Vec<Result<GenerationDelta, ProviderError>> {
    let mut deltas: Vec<_> = text
        .split_inclusive(' ')
        .map(|w| Ok(GenerationDelta::Text { text: w.to_string() }))
        .collect();
    deltas.push(Ok(GenerationDelta::Usage {
        usage: Usage {
            prompt_tokens: 1200,
            completion_tokens: 80,
            total_tokens: 1280,
            cache_creation_tokens: 0,
            cache_read_tokens: 900,
        },
    }));
    deltas.push(Ok(GenerationDelta::Stop {
        reason: Some("end_turn".into()),
    }));
    deltas
}

/// Optional text, then one tool call, ending the turn with `tool_use`.
pub fn tool_call_stream(text: &str, id: &str, name: &str, input: Value) -> Vec<Result<GenerationDelta, ProviderError>> {
    let mut deltas = Vec::new();
    if !text.is_empty() {
        deltas.push(Ok(GenerationDelta::Text { text: text.to_string() }));
    }
    deltas.push(Ok(GenerationDelta::ToolUseStart {
        id: id.to_string(),
        name: name.to_string(),
    }));
    deltas.push(Ok(GenerationDelta::ToolCall {
        call: ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input,
        },
    }));
    deltas.push(Ok(GenerationDelta::Usage {
        usage: Usage {
            prompt_tokens: 1000,
            completion_tokens: 40,
            total_tokens: 1040,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        },
    }));
    deltas.push(Ok(GenerationDelta::Stop {
        reason: Some("tool_use".into()),
    }));
    deltas
}

/// A client tool that records its calls and answers with a fixed text.
pub struct RecordingTool {
    name: String,
    output: String,
    calls: Mutex<Vec<(String, Value)>>,
}

impl RecordingTool {
    pub fn new(name: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            output: output.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(owner, input)` per call, in order.
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientTool for RecordingTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, owner: &str, input: &Value) -> String {
        self.calls.lock().unwrap().push((owner.to_string(), input.clone()));
        self.output.clone()
    }
}

pub fn citation(document_index: Option<usize>, source: Option<&str>, cited_text: &str) -> GenerationDelta {
    GenerationDelta::Citation {
        citation: CitationRef {
            document_index,
            source: source.map(str::to_string),
            title: None,
            cited_text: cited_text.to_string(),
        },
    }
}

const VOCABULARY: [&str; 8] = ["kdb", "questdb", "clickhouse", "ingest", "latency", "pricing", "sql", "cloud"];

/// Bag-of-keywords vectors over a fixed vocabulary.
pub fn keyword_vector(text: &str) -> Vec<f32> {
    let text = text.to_lowercase();
    VOCABULARY
        .iter()
        .map(|word| text.matches(word).count() as f32)
        .collect()
}

/// Deterministic embedder over [`keyword_vector`].
pub struct KeywordEmbedder {
    failing: bool,
    delay: Duration,
}

impl KeywordEmbedder {
    pub fn new() -> Self {
        Self {
            failing: false,
            delay: Duration::ZERO,
        }
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            delay: Duration::ZERO,
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { failing: false, delay }
    }
}

impl Default for KeywordEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Embedder for KeywordEmbedder {
    fn name(&self) -> &str {
        "keyword"
    }

    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing {
            return Err(ProviderError::Network("embedding service unreachable".into()));
        }
        Ok(inputs.iter().map(|t| keyword_vector(t)).collect())
    }
}

fn entry(id: &str, competitor: &str, topic: &str, text: &str) -> CorpusEntry {
    let metadata = json!({
        "competitor": competitor,
        "primary_topic": topic,
        "source_type": "official_docs",
        "credibility": "high",
        "parent_doc_id": format!("{competitor}-{topic}"),
        "source_url": format!("https://docs.example/{competitor}/{topic}"),
        "source_title": format!("{competitor} {topic}"),
        "content_date": "2025-06-01",
    });
    CorpusEntry {
        id: id.into(),
        text: text.into(),
        metadata: metadata.as_object().cloned().unwrap_or_default(),
        embedding: keyword_vector(text),
    }
}

/// A seven-passage corpus embedded with [`keyword_vector`].
pub fn corpus_index() -> InMemoryIndex {
    InMemoryIndex::new(vec![
        entry("kx-ingest", "kx", "ingest", "kdb+ tick ingest handles millions of updates per second."),
        entry("kx-latency", "kx", "latency", "kdb+ query latency on in-memory partitions is in microseconds."),
        entry("qdb-ingest", "questdb", "ingest", "QuestDB ingest over ILP reaches several million rows per second."),
        entry("qdb-sql", "questdb", "sql", "QuestDB extends SQL with SAMPLE BY for time series."),
        entry("qdb-cloud", "questdb", "cloud", "QuestDB cloud offers managed ingest."),
        entry("ch-pricing", "clickhouse", "pricing", "ClickHouse cloud pricing is usage based."),
        entry("ch-latency", "clickhouse", "latency", "ClickHouse latency for large scans depends on sorting keys."),
    ])
    .expect("corpus entries share one dimension")
}

/// A fused result with the given metadata.
pub fn fused(id: &str, metadata: Value) -> FusedResult {
    FusedResult {
        id: id.into(),
        text: format!("text {id}"),
        source_metadata: metadata.as_object().cloned().unwrap_or_default(),
        fused_rank: 1,
        fused_score: 0.0,
        best_similarity: 0.5,
        contributing_strategies: [StrategyName::Direct].into_iter().collect(),
    }
}

/// An in-memory session store whose exchange writes take `delay`.
pub struct SlowSessionStore {
    inner: InMemorySessionStore,
    delay: Duration,
}

impl SlowSessionStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemorySessionStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl SessionStore for SlowSessionStore {
    fn name(&self) -> &str {
        "slow"
    }

    async fn create_session(&self, owner: &str) -> Result<SessionId, SessionError> {
        self.inner.create_session(owner).await
    }

    async fn append_turn(&self, session_id: &SessionId, turn: ConversationTurn) -> Result<(), SessionError> {
        self.inner.append_turn(session_id, turn).await
    }

    async fn append_exchange(
        &self,
        session_id: &SessionId,
        user: ConversationTurn,
        assistant: ConversationTurn,
        title: &str,
    ) -> Result<(), SessionError> {
        tokio::time::sleep(self.delay).await;
        self.inner.append_exchange(session_id, user, assistant, title).await
    }

    async fn recent_turns(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ConversationTurn>, SessionError> {
        self.inner.recent_turns(session_id, limit).await
    }

    async fn all_turns(&self, session_id: &SessionId) -> Result<Vec<ConversationTurn>, SessionError> {
        self.inner.all_turns(session_id).await
    }

    async fn session_token_totals(&self, session_id: &SessionId) -> Result<TokenTotals, SessionError> {
        self.inner.session_token_totals(session_id).await
    }

    async fn list_sessions(&self, owner: &str, limit: usize) -> Result<Vec<SessionSummary>, SessionError> {
        self.inner.list_sessions(owner, limit).await
    }

    async fn set_title_if_empty(&self, session_id: &SessionId, title: &str) -> Result<(), SessionError> {
        self.inner.set_title_if_empty(session_id, title).await
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<bool, SessionError> {
        self.inner.delete_session(session_id).await
    }

    async fn delete_owner_sessions(&self, owner: &str) -> Result<u64, SessionError> {
        self.inner.delete_owner_sessions(owner).await
    }
}
