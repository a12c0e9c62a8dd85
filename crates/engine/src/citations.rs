//! Citation sources and the mapping from provider citations to them.
//!
//! Passages become numbered sources (1-based) deduplicated by parent
//! document and URL. Provider citations are resolved to those numbers by
//! document index first, then by locator; anything unknown (typically a
//! web result) is appended as a new source.

use std::collections::HashMap;

use ciq_core::passage::FusedResult;
use ciq_core::provider::{CitationRef, SourceDocument};
use serde::{Deserialize, Serialize};

const PREVIEW_CHARS: usize = 200;

/// One citable source as shown to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CitationSource {
    /// 1-based number used by `citation_delta` events.
    pub index: usize,
    /// First passage that introduced this source, absent for web results.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passage_id: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub source_type: String,
    #[serde(default)]
    pub credibility: String,
    #[serde(default)]
    pub competitor: String,
    #[serde(default)]
    pub primary_topic: String,
    #[serde(default)]
    pub content_date: String,
    #[serde(default)]
    pub text_preview: String,
}

/// Locator for a passage: its URL, or a synthetic `vectordb://` id.
pub fn passage_locator(passage: &FusedResult) -> String {
    let url = passage.metadata_str("source_url");
    if url.is_empty() {
        format!("vectordb://{}", passage.id)
    } else {
        url
    }
}

/// The document handed to the provider for one passage.
pub fn source_document(passage: &FusedResult) -> SourceDocument {
    let title = passage.metadata_str("source_title");
    let title = if title.is_empty() { passage.id.clone() } else { title };
    let source_type = passage.metadata_str("source_type");
    let credibility = passage.metadata_str("credibility");

    let title = match (source_type.is_empty(), credibility.is_empty()) {
        (true, true) => title,
        (false, true) => format!("{title} ({source_type})"),
        (true, false) => format!("{title} ({credibility})"),
        (false, false) => format!("{title} ({source_type}, {credibility})"),
    };

    SourceDocument {
        source: passage_locator(passage),
        title,
        text: passage.text.clone(),
    }
}

/// Single-line preview, truncated with an ellipsis.
pub fn text_preview(text: &str) -> String {
    let flat = text.replace(['\r', '\n'], " ");
    let flat = flat.trim();
    let cut = crate::prompts::truncate_chars(flat, PREVIEW_CHARS);
    if cut.len() < flat.len() {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}

fn dedup_key(passage: &FusedResult) -> String {
    let parent = passage.metadata_str("parent_doc_id");
    let url = passage.metadata_str("source_url");
    if parent.is_empty() && url.is_empty() {
        format!("id:{}", passage.id)
    } else {
        format!("{parent}\u{1f}{url}")
    }
}

fn none_if_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

/// Per-query citation state.
#[derive(Debug, Clone, Default)]
pub struct CitationTracker {
    sources: Vec<CitationSource>,
    /// Document position in the request → source number.
    by_document: Vec<usize>,
    /// Locator or title → source number.
    by_locator: HashMap<String, usize>,
}

impl CitationTracker {
    /// Number the sources for passages in prompt order.
    pub fn new(passages: &[FusedResult]) -> Self {
        let mut tracker = Self::default();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for passage in passages {
            let key = dedup_key(passage);
            let index = match by_key.get(&key) {
                Some(&index) => index,
                None => {
                    let index = tracker.sources.len() + 1;
                    let title = passage.metadata_str("source_title");
                    tracker.sources.push(CitationSource {
                        index,
                        passage_id: Some(passage.id.clone()),
                        title: if title.is_empty() { passage.id.clone() } else { title },
                        url: none_if_empty(passage.metadata_str("source_url")),
                        source_type: passage.metadata_str("source_type"),
                        credibility: passage.metadata_str("credibility"),
                        competitor: passage.metadata_str("competitor"),
                        primary_topic: passage.metadata_str("primary_topic"),
                        content_date: passage.metadata_str("content_date"),
                        text_preview: text_preview(&passage.text),
                    });
                    by_key.insert(key, index);
                    index
                }
            };
            tracker.by_document.push(index);
            tracker.by_locator.entry(passage_locator(passage)).or_insert(index);
        }
        tracker
    }

    pub fn sources(&self) -> &[CitationSource] {
        &self.sources
    }

    /// Resolve a provider citation to a source number.
    ///
    /// Returns the new source too when the citation introduced one.
    pub fn resolve(&mut self, citation: &CitationRef) -> (usize, Option<CitationSource>) {
        if let Some(&index) = citation.document_index.and_then(|i| self.by_document.get(i)) {
            return (index, None);
        }
        for locator in [&citation.source, &citation.title].into_iter().flatten() {
            if let Some(&index) = self.by_locator.get(locator) {
                return (index, None);
            }
        }

        let index = self.sources.len() + 1;
        let title = citation
            .title
            .clone()
            .or_else(|| citation.source.clone())
            .unwrap_or_else(|| format!("Source {index}"));
        let source = CitationSource {
            index,
            passage_id: None,
            title,
            url: citation.source.clone(),
            source_type: "web".into(),
            credibility: String::new(),
            competitor: String::new(),
            primary_topic: String::new(),
            content_date: String::new(),
            text_preview: text_preview(&citation.cited_text),
        };
        for locator in [&citation.source, &citation.title].into_iter().flatten() {
            self.by_locator.insert(locator.clone(), index);
        }
        self.sources.push(source.clone());
        (index, Some(source))
    }
}
