//! Generation orchestration.
//!
//! Each query runs as one spawned task that walks
//! `Analyzing → Retrieving → Assembling → Generating → {Done | Error}` and
//! pushes [`StreamEvent`]s into a bounded channel. The caller reads the
//! channel through a [`QueryHandle`].
//!
//! # Termination
//!
//! A completed query emits exactly one terminal event: `done` after
//! success, `error` after a generation failure or an impossible assembly.
//! Cancellation (explicit, or by dropping the receiver) emits neither and
//! aborts the in-flight generation call.
//!
//! # Client tools
//!
//! With a memory tool configured and an owner on the request, a generation
//! call that ends in `tool_use` is followed by local execution of the calls
//! and a continuation call carrying their results, up to the configured
//! number of calls. Answer text and usage accumulate across the calls.
//!
//! The exchange is written in one atomic store call as the last cancellable
//! step. `metadata` and `done` are sent only after it resolves, so a
//! cancelled query leaves no turns behind and every `done` in a session
//! follows a stored exchange.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ciq_config::AppConfig;
use ciq_core::error::ProviderError;
use ciq_core::filter::QueryFilters;
use ciq_core::passage::FusedResult;
use ciq_core::provider::{GenerationDelta, Provider, ProviderRequest, Usage};
use ciq_core::search::{Embedder, VectorSearch};
use ciq_core::session::{ConversationTurn, SessionId, SessionStore};
use ciq_core::tool::{ClientTool, ToolCall, ToolOutput, ToolRound};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analysis::QueryAnalyzer;
use crate::citations::CitationTracker;
use crate::context::{AssemblyInput, CompactedHistory, HistoryCompactor, PromptAssembler, PromptPlan, TokenEstimator};
use crate::error::QueryError;
use crate::followups::FollowupGenerator;
use crate::retriever::Retriever;
use crate::stream_event::{QueryMetadata, StatusStep, StreamEvent};

const EVENT_BUFFER: usize = 64;
const TITLE_CHARS: usize = 80;

/// One caller request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub filters: QueryFilters,
    /// Fused passages to retrieve; the configured default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_budget_override: Option<usize>,
    #[serde(default)]
    pub fast_mode: bool,
    #[serde(default = "default_reasoning")]
    pub reasoning_enabled: bool,
    /// Whose memory the model may use; no memory tool without one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

fn default_reasoning() -> bool {
    true
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            filters: QueryFilters::default(),
            result_count: None,
            history_budget_override: None,
            fast_mode: false,
            reasoning_enabled: true,
            owner: None,
        }
    }

    pub fn in_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_filters(mut self, filters: QueryFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_result_count(mut self, count: usize) -> Self {
        self.result_count = Some(count);
        self
    }

    pub fn with_history_budget(mut self, tokens: usize) -> Self {
        self.history_budget_override = Some(tokens);
        self
    }

    pub fn fast(mut self) -> Self {
        self.fast_mode = true;
        self
    }

    pub fn without_reasoning(mut self) -> Self {
        self.reasoning_enabled = false;
        self
    }

    pub fn for_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Per-query state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Analyzing,
    Retrieving,
    Assembling,
    Generating,
    Done,
    Error,
}

/// The caller's side of a running query.
pub struct QueryHandle {
    events: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    task: JoinHandle<Phase>,
}

impl QueryHandle {
    /// Next event, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Cancel the query. No terminal event follows.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain every event until the stream ends.
    pub async fn collect(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        events
    }

    /// Discard the remaining events and wait for the query task to finish.
    ///
    /// Returns the phase it ended in: `Done`, `Error`, or the phase a
    /// cancellation interrupted. `None` if the task panicked.
    pub async fn join(self) -> Option<Phase> {
        let QueryHandle { mut events, task, .. } = self;
        while events.recv().await.is_some() {}
        match task.await {
            Ok(phase) => Some(phase),
            Err(e) => {
                warn!(error = %e, "Query task panicked");
                None
            }
        }
    }

    /// The events as a `Stream`. Dropping the stream cancels the query.
    pub fn into_stream(self) -> ReceiverStream<StreamEvent> {
        ReceiverStream::new(self.events)
    }
}

/// Shared collaborators and components; cheap to clone.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<EngineInner>,
    memory: Option<MemoryAccess>,
}

#[derive(Clone)]
struct MemoryAccess {
    tool: Arc<dyn ClientTool>,
    max_calls: usize,
}

struct EngineInner {
    provider: Arc<dyn Provider>,
    sessions: Option<Arc<dyn SessionStore>>,
    analyzer: QueryAnalyzer,
    retriever: Retriever,
    followups: FollowupGenerator,
    assembler: PromptAssembler,
    history: HistoryCompactor,
    estimator: TokenEstimator,
    default_result_count: usize,
    generation_timeout: Duration,
}

impl QueryEngine {
    pub fn new(
        config: &AppConfig,
        provider: Arc<dyn Provider>,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorSearch>,
        sessions: Option<Arc<dyn SessionStore>>,
    ) -> Self {
        let auxiliary_model = config.generation.auxiliary_model().to_string();
        let inner = EngineInner {
            analyzer: QueryAnalyzer::new(provider.clone(), &auxiliary_model, config.analysis.clone()),
            retriever: Retriever::new(
                embedder,
                index,
                provider.clone(),
                &auxiliary_model,
                config.retrieval.clone(),
            ),
            followups: FollowupGenerator::new(provider.clone(), &auxiliary_model, config.followups.clone()),
            assembler: PromptAssembler::new(config),
            history: HistoryCompactor::from_config(&config.history),
            estimator: TokenEstimator::new(config.history.chars_per_token),
            default_result_count: config.retrieval.default_result_count,
            generation_timeout: Duration::from_secs(config.generation.timeout_secs),
            provider,
            sessions,
        };
        Self {
            inner: Arc::new(inner),
            memory: None,
        }
    }

    /// Offer `tool` to the model on requests that name an owner.
    ///
    /// `max_calls` bounds the generation calls of one query, so at most
    /// `max_calls - 1` rounds of tool results are sent back.
    pub fn with_memory_tool(mut self, tool: Arc<dyn ClientTool>, max_calls: usize) -> Self {
        self.memory = Some(MemoryAccess {
            tool,
            max_calls: max_calls.max(1),
        });
        self
    }

    /// Start answering a query. Events arrive on the returned handle.
    pub fn start(&self, request: QueryRequest) -> QueryHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let sink = EventSink {
            tx,
            cancel: cancel.clone(),
        };
        let inner = self.inner.clone();
        let memory = self.memory.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { run_query(inner, memory, request, sink, token).await });
        QueryHandle {
            events: rx,
            cancel,
            task,
        }
    }
}

/// Sending half of one query's event stream.
///
/// The terminal methods consume the sink, so at most one terminal event
/// can be sent.
struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl EventSink {
    async fn emit(&self, event: StreamEvent) -> Result<(), QueryError> {
        if self.tx.send(event).await.is_err() {
            // Receiver gone: nobody is listening, stop the work.
            self.cancel.cancel();
            return Err(QueryError::CancelledByCaller);
        }
        Ok(())
    }

    async fn finish_done(self, metadata: QueryMetadata) {
        let metadata = Box::new(metadata);
        if self.tx.send(StreamEvent::Metadata { metadata }).await.is_ok() {
            let _ = self.tx.send(StreamEvent::Done).await;
        }
    }

    async fn finish_error(self, err: &QueryError) {
        let _ = self
            .tx
            .send(StreamEvent::Error {
                kind: err.kind().to_string(),
                message: err.to_string(),
            })
            .await;
    }
}

async fn run_query(
    inner: Arc<EngineInner>,
    memory: Option<MemoryAccess>,
    request: QueryRequest,
    sink: EventSink,
    cancel: CancellationToken,
) -> Phase {
    let session = request.session_id.as_ref().map(|s| s.to_string()).unwrap_or_default();
    let tools = match (&memory, &request.owner) {
        (Some(memory), Some(owner)) => Some(ToolAccess {
            tool: memory.tool.as_ref(),
            owner: owner.as_str(),
            max_calls: memory.max_calls,
        }),
        _ => None,
    };
    let mut run = QueryRun {
        inner: &inner,
        tools,
        request: &request,
        sink: &sink,
        cancel: &cancel,
        phase: Phase::Analyzing,
        started: Instant::now(),
        metadata: QueryMetadata {
            session_id: request.session_id.as_ref().map(|s| s.to_string()),
            fast_mode: request.fast_mode,
            ..Default::default()
        },
    };

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(QueryError::CancelledByCaller),
        _ = async {
            sink.tx.closed().await;
            // Signal before the generation future is dropped.
            cancel.cancel();
        } => Err(QueryError::CancelledByCaller),
        r = run.drive() => r,
    };
    let phase = run.phase;
    if matches!(result, Err(ref e) if !matches!(e, QueryError::CancelledByCaller)) {
        run.enter(Phase::Error);
    }
    let final_phase = run.phase;
    let metadata = std::mem::take(&mut run.metadata);
    drop(run);

    match result {
        // Past the store write: nothing left to cancel.
        Ok(()) => sink.finish_done(metadata).await,
        Err(QueryError::CancelledByCaller) => {
            cancel.cancel();
            info!(session_id = %session, ?phase, "Query cancelled");
        }
        Err(e) => {
            error!(session_id = %session, failed_in = ?phase, kind = e.kind(), error = %e, "Query failed");
            sink.finish_error(&e).await;
        }
    }
    final_phase
}

/// Output of a completed generation, over all of its calls.
struct Generated {
    answer: String,
    usage: Usage,
    stop_reason: Option<String>,
}

/// Output of one generation call.
struct CallOutput {
    text: String,
    usage: Usage,
    stop_reason: Option<String>,
    tool_calls: Vec<ToolCall>,
}

/// The client tool available to one query, bound to its owner.
struct ToolAccess<'a> {
    tool: &'a dyn ClientTool,
    owner: &'a str,
    max_calls: usize,
}

/// State of one query while it runs.
struct QueryRun<'a> {
    inner: &'a EngineInner,
    tools: Option<ToolAccess<'a>>,
    request: &'a QueryRequest,
    sink: &'a EventSink,
    cancel: &'a CancellationToken,
    phase: Phase,
    started: Instant,
    metadata: QueryMetadata,
}

fn ms_since(t: Instant) -> u64 {
    t.elapsed().as_millis() as u64
}

impl QueryRun<'_> {
    fn enter(&mut self, phase: Phase) {
        debug!(from = ?self.phase, to = ?phase, "Query phase");
        self.phase = phase;
    }

    async fn emit(&self, event: StreamEvent) -> Result<(), QueryError> {
        self.sink.emit(event).await
    }

    async fn drive(&mut self) -> Result<(), QueryError> {
        let inner = self.inner;
        let request = self.request;
        let query = request.text.as_str();

        // ── Analyzing ──
        self.enter(Phase::Analyzing);
        self.emit(StreamEvent::status(StatusStep::Analyzing, "Analyzing query...")).await?;
        let t = Instant::now();
        let analysis = inner.analyzer.analyze(query).await;
        let filters = inner.analyzer.effective_filters(&request.filters, &analysis.analysis);
        let filter = filters.to_metadata_filter();
        self.metadata.timings.analysis_ms = ms_since(t);
        self.emit(StreamEvent::Status {
            step: StatusStep::AnalyzingDone,
            message: None,
            elapsed_ms: Some(self.metadata.timings.analysis_ms),
            passages: None,
        })
        .await?;
        self.metadata.analysis_status = Some(analysis.status);
        self.metadata.analysis = Some(analysis.analysis);
        self.metadata.filters = filters;
        self.metadata.filter_applied = filter.clone();

        // ── Retrieving ──
        self.enter(Phase::Retrieving);
        self.emit(StreamEvent::status(StatusStep::Retrieving, "Searching knowledge base..."))
            .await?;
        let t = Instant::now();
        let result_count = request.result_count.unwrap_or(inner.default_result_count);
        let retrieval = inner.retriever.retrieve(query, filter.as_ref(), result_count).await;
        self.metadata.timings.retrieval_ms = ms_since(t);
        self.metadata.passages_retrieved = retrieval.results.len();
        self.metadata.strategies = retrieval.reports;
        self.emit(StreamEvent::Status {
            step: StatusStep::RetrievingDone,
            message: None,
            elapsed_ms: Some(self.metadata.timings.retrieval_ms),
            passages: Some(retrieval.results.len()),
        })
        .await?;

        // ── Assembling ──
        self.enter(Phase::Assembling);
        let t = Instant::now();
        let history = self.load_history().await;
        let plan = self.assemble(history, retrieval.results)?;
        let mut citations = CitationTracker::new(&plan.passages);
        self.metadata.timings.assembly_ms = ms_since(t);
        self.emit(StreamEvent::CitationSource {
            sources: citations.sources().to_vec(),
        })
        .await?;

        // ── Generating ──
        self.enter(Phase::Generating);
        self.emit(StreamEvent::status(StatusStep::Synthesizing, "Synthesizing answer..."))
            .await?;
        let t = Instant::now();
        let generated = self.generate_with_timeout(&plan, &mut citations).await?;
        self.metadata.timings.generation_ms = ms_since(t);
        self.metadata.stop_reason = generated.stop_reason.clone();
        self.emit(StreamEvent::Status {
            step: StatusStep::SynthesizingDone,
            message: None,
            elapsed_ms: Some(self.metadata.timings.generation_ms),
            passages: None,
        })
        .await?;

        let t = Instant::now();
        let questions = inner.followups.generate(query, &generated.answer).await;
        self.metadata.timings.followups_ms = ms_since(t);
        self.emit(StreamEvent::Followups { questions }).await?;
        self.emit(StreamEvent::Usage {
            usage: generated.usage,
        })
        .await?;

        // Last cancellable step; `metadata` and `done` follow in `run_query`.
        self.metadata.persisted = self.persist(&plan, &generated).await;
        self.metadata.timings.total_ms = ms_since(self.started);
        info!(
            session_id = self.metadata.session_id.as_deref().unwrap_or(""),
            model = %plan.model,
            passages = plan.passages.len(),
            persisted = self.metadata.persisted,
            elapsed_ms = self.metadata.timings.total_ms,
            "Query complete"
        );

        self.enter(Phase::Done);
        Ok(())
    }

    async fn load_history(&self) -> CompactedHistory {
        let (Some(store), Some(session_id)) = (&self.inner.sessions, &self.request.session_id) else {
            return CompactedHistory::default();
        };
        // An override may ask for more than the prompt can hold.
        let requested = self
            .request
            .history_budget_override
            .unwrap_or(self.inner.history.budget_tokens());
        let budget = requested.min(self.inner.assembler.history_allowance(&self.request.text));
        let compactor = self.inner.history.clone().with_budget(budget);
        match compactor.load(store.as_ref(), session_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "History unavailable, continuing without it");
                CompactedHistory::default()
            }
        }
    }

    fn assemble(&mut self, history: CompactedHistory, passages: Vec<FusedResult>) -> Result<PromptPlan, QueryError> {
        let plan = self.inner.assembler.assemble(AssemblyInput {
            query: &self.request.text,
            history,
            passages,
            fast_mode: self.request.fast_mode,
            reasoning_requested: self.request.reasoning_enabled,
        })?;

        self.metadata.model = plan.model.clone();
        self.metadata.reasoning_enabled = plan.reasoning_enabled;
        self.metadata.passages_included = plan.stats.passages_included;
        self.metadata.history_turns_included = plan.stats.history_turns;
        self.metadata.history_tokens = plan.stats.history_tokens;
        self.metadata.prompt_tokens_estimate = plan.stats.total_tokens;
        self.metadata.plan = Some(plan.stats.clone());
        debug!(
            model = %plan.model,
            reasoning = plan.reasoning_enabled,
            passages = plan.stats.passages_included,
            history_turns = plan.stats.history_turns,
            tokens = plan.stats.total_tokens,
            "Prompt assembled"
        );
        Ok(plan)
    }

    async fn generate_with_timeout(
        &self,
        plan: &PromptPlan,
        citations: &mut CitationTracker,
    ) -> Result<Generated, QueryError> {
        // A child token lets the timeout abort the provider call without
        // cancelling the query as a whole.
        let call = self.cancel.child_token();
        let deadline = self.inner.generation_timeout;
        tokio::select! {
            r = self.generate(plan, citations, call.clone()) => r,
            _ = async {
                tokio::time::sleep(deadline).await;
                call.cancel();
            } => Err(QueryError::GenerationFailure(ProviderError::Timeout(format!(
                "no completion within {}s",
                deadline.as_secs()
            )))),
        }
    }

    async fn generate(
        &self,
        plan: &PromptPlan,
        citations: &mut CitationTracker,
        call: CancellationToken,
    ) -> Result<Generated, QueryError> {
        let mut request = plan.to_request();
        request.memory_tool = self.tools.is_some();

        let mut generated = Generated {
            answer: String::new(),
            usage: Usage::default(),
            stop_reason: None,
        };
        let mut calls_made = 0;

        loop {
            let output = self.stream_call(request.clone(), citations, call.clone()).await?;
            calls_made += 1;
            generated.answer.push_str(&output.text);
            generated.usage.accumulate(&output.usage);
            generated.stop_reason = output.stop_reason;

            let Some(tools) = &self.tools else {
                return Ok(generated);
            };
            if generated.stop_reason.as_deref() != Some("tool_use") || output.tool_calls.is_empty() {
                return Ok(generated);
            }
            if calls_made >= tools.max_calls {
                warn!(calls = calls_made, "Tool call limit reached, keeping the answer so far");
                return Ok(generated);
            }

            let mut outputs = Vec::with_capacity(output.tool_calls.len());
            for tool_call in &output.tool_calls {
                let content = if tool_call.name == tools.tool.name() {
                    tools.tool.execute(tools.owner, &tool_call.input).await
                } else {
                    format!("Error: unknown tool {}", tool_call.name)
                };
                debug!(tool = %tool_call.name, id = %tool_call.id, "Tool call executed");
                outputs.push(ToolOutput {
                    tool_use_id: tool_call.id.clone(),
                    content,
                });
            }
            self.emit(StreamEvent::status(StatusStep::MemoryDone, "Memory updated"))
                .await?;

            request.tool_rounds.push(ToolRound {
                text: output.text,
                calls: output.tool_calls,
                outputs,
            });
            // Continuations would need the thinking blocks passed back.
            request.reasoning = false;
        }
    }

    async fn stream_call(
        &self,
        request: ProviderRequest,
        citations: &mut CitationTracker,
        call: CancellationToken,
    ) -> Result<CallOutput, QueryError> {
        let mut deltas = self.inner.provider.stream(request, call).await?;

        let mut text = String::new();
        let mut usage = Usage::default();
        let mut tool_calls = Vec::new();

        while let Some(delta) = deltas.recv().await {
            match delta? {
                GenerationDelta::Thinking { text } => {
                    self.emit(StreamEvent::ThinkingDelta { text }).await?;
                }
                GenerationDelta::Text { text: part } => {
                    text.push_str(&part);
                    self.emit(StreamEvent::AnswerToken { text: part }).await?;
                }
                GenerationDelta::Citation { citation } => {
                    let (source_index, added) = citations.resolve(&citation);
                    if let Some(source) = added {
                        self.emit(StreamEvent::CitationSource { sources: vec![source] })
                            .await?;
                    }
                    self.emit(StreamEvent::CitationDelta {
                        source_index,
                        cited_text: citation.cited_text,
                    })
                    .await?;
                }
                GenerationDelta::ToolUseStart { name, .. } => {
                    let status = match &self.tools {
                        Some(tools) if tools.tool.name() == name => {
                            StreamEvent::status(StatusStep::MemoryTool, format!("Using {name}..."))
                        }
                        _ => StreamEvent::status(StatusStep::ToolUse, format!("Using {name}...")),
                    };
                    self.emit(status).await?;
                }
                GenerationDelta::ToolCall { call } => tool_calls.push(call),
                GenerationDelta::ToolResult {
                    tool_use_id,
                    name,
                    content,
                } => {
                    self.emit(StreamEvent::ToolResult {
                        id: tool_use_id,
                        name,
                        output: content,
                    })
                    .await?;
                }
                GenerationDelta::Usage { usage: u } => usage.merge(&u),
                GenerationDelta::Stop { reason } => {
                    return Ok(CallOutput {
                        text,
                        usage,
                        stop_reason: reason,
                        tool_calls,
                    });
                }
            }
        }

        Err(QueryError::GenerationFailure(ProviderError::StreamInterrupted(
            "generation stream closed before completion".into(),
        )))
    }

    /// Store the exchange in one atomic call. Returns whether it was stored.
    ///
    /// Dropping this future before it resolves (on cancellation) stores
    /// nothing.
    async fn persist(&self, plan: &PromptPlan, generated: &Generated) -> bool {
        let (Some(store), Some(session_id)) = (&self.inner.sessions, &self.request.session_id) else {
            return false;
        };
        let query = &self.request.text;

        let user = ConversationTurn::user(query.clone(), self.inner.estimator.estimate(query));
        let mut assistant =
            ConversationTurn::assistant(generated.answer.clone(), self.inner.estimator.estimate(&generated.answer));
        assistant.model = Some(plan.model.clone());
        assistant.tokens_input = generated.usage.prompt_tokens;
        assistant.tokens_output = generated.usage.completion_tokens;
        assistant.cache_creation_tokens = generated.usage.cache_creation_tokens;
        assistant.cache_read_tokens = generated.usage.cache_read_tokens;

        let title = crate::prompts::truncate_chars(query.trim(), TITLE_CHARS);
        match store.append_exchange(session_id, user, assistant, title).await {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to persist turns");
                false
            }
        }
    }
}
