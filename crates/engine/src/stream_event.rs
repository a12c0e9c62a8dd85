//! The caller-facing event protocol.
//!
//! One query produces an ordered sequence of [`StreamEvent`]s:
//! - `status`          — phase transitions and tool activity (web search, memory)
//! - `thinking_delta`  — extended-reasoning text
//! - `citation_source` — numbered sources (once before generation, then for each new source)
//! - `citation_delta`  — a citation of a source by number
//! - `answer_token`    — answer text
//! - `tool_result`     — a server-side tool finished
//! - `followups`       — suggested next questions
//! - `usage`           — token counters for the generation call
//! - `metadata`        — what the engine did to answer
//! - `error` / `done`  — exactly one of these ends a completed stream
//!
//! A cancelled query ends without either terminal event.

use ciq_core::filter::{MetadataFilter, QueryFilters};
use ciq_core::provider::Usage;
use serde::{Deserialize, Serialize};

use crate::analysis::{AnalysisStatus, QueryAnalysis};
use crate::citations::CitationSource;
use crate::context::PlanStats;
use crate::retriever::StrategyReport;

/// Named steps reported by `status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusStep {
    Analyzing,
    AnalyzingDone,
    Retrieving,
    RetrievingDone,
    Synthesizing,
    ToolUse,
    MemoryTool,
    MemoryDone,
    SynthesizingDone,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status {
        step: StatusStep,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        elapsed_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        passages: Option<usize>,
    },

    ThinkingDelta { text: String },

    CitationSource { sources: Vec<CitationSource> },

    CitationDelta { source_index: usize, cited_text: String },

    AnswerToken { text: String },

    ToolResult {
        id: String,
        name: String,
        output: serde_json::Value,
    },

    Usage { usage: Usage },

    Followups { questions: Vec<String> },

    Metadata { metadata: Box<QueryMetadata> },

    Error { kind: String, message: String },

    Done,
}

impl StreamEvent {
    pub fn status(step: StatusStep, message: impl Into<String>) -> Self {
        Self::Status {
            step,
            message: Some(message.into()),
            elapsed_ms: None,
            passages: None,
        }
    }

    /// SSE event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::ThinkingDelta { .. } => "thinking_delta",
            Self::CitationSource { .. } => "citation_source",
            Self::CitationDelta { .. } => "citation_delta",
            Self::AnswerToken { .. } => "answer_token",
            Self::ToolResult { .. } => "tool_result",
            Self::Usage { .. } => "usage",
            Self::Followups { .. } => "followups",
            Self::Metadata { .. } => "metadata",
            Self::Error { .. } => "error",
            Self::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }

    /// Render as one Server-Sent Events frame.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(self).unwrap_or_else(|e| {
            serde_json::json!({"type": "error", "kind": "serialization", "message": e.to_string()}).to_string()
        });
        format!("event: {}\ndata: {data}\n\n", self.event_type())
    }
}

/// Milliseconds spent per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTimings {
    pub analysis_ms: u64,
    pub retrieval_ms: u64,
    pub assembly_ms: u64,
    pub generation_ms: u64,
    pub followups_ms: u64,
    pub total_ms: u64,
}

/// Everything the engine decided while answering one query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub model: String,
    pub fast_mode: bool,
    /// After the fast-mode override.
    pub reasoning_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_status: Option<AnalysisStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<QueryAnalysis>,
    pub filters: QueryFilters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_applied: Option<MetadataFilter>,
    pub strategies: Vec<StrategyReport>,
    pub passages_retrieved: usize,
    pub passages_included: usize,
    pub history_turns_included: usize,
    pub history_tokens: usize,
    pub prompt_tokens_estimate: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    pub timings: PhaseTimings,
    pub persisted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialization() {
        let event = StreamEvent::status(StatusStep::Retrieving, "Searching");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"status""#));
        assert!(json.contains(r#""step":"retrieving""#));
        assert!(!json.contains("elapsed_ms"));
    }

    #[test]
    fn done_is_bare() {
        assert_eq!(serde_json::to_string(&StreamEvent::Done).unwrap(), r#"{"type":"done"}"#);
        assert!(StreamEvent::Done.is_terminal());
    }

    #[test]
    fn error_event() {
        let event = StreamEvent::Error {
            kind: "generation_failure".into(),
            message: "rate limited".into(),
        };
        assert!(event.is_terminal());
        assert_eq!(event.event_type(), "error");
    }

    #[test]
    fn event_type_matches_tag() {
        let events = vec![
            StreamEvent::ThinkingDelta { text: "hm".into() },
            StreamEvent::CitationDelta {
                source_index: 1,
                cited_text: "x".into(),
            },
            StreamEvent::AnswerToken { text: "a".into() },
            StreamEvent::Usage {
                usage: Usage::default(),
            },
            StreamEvent::Followups { questions: vec![] },
            StreamEvent::Metadata {
                metadata: Box::default(),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.event_type());
            assert!(!event.is_terminal());
        }
    }

    #[test]
    fn sse_frame() {
        let frame = StreamEvent::AnswerToken { text: "kdb+".into() }.to_sse();
        assert_eq!(frame, "event: answer_token\ndata: {\"type\":\"answer_token\",\"text\":\"kdb+\"}\n\n");
    }

    #[test]
    fn roundtrip_metadata() {
        let metadata = QueryMetadata {
            model: "m".into(),
            passages_retrieved: 4,
            persisted: true,
            ..Default::default()
        };
        let event = StreamEvent::Metadata {
            metadata: Box::new(metadata.clone()),
        };
        let back: StreamEvent = serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(back, StreamEvent::Metadata { metadata: Box::new(metadata) });
    }
}
