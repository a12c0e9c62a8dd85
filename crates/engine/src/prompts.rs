//! Instruction texts for the synthesis call and the auxiliary model calls.

/// Grounded, cited answer synthesis.
pub const SYNTHESIS_SYSTEM: &str = "\
You are a senior competitive intelligence analyst for capital markets data \
platforms. Your readers are sales engineers and account executives who need \
precise, evidence-backed answers to competitive questions.

Rules:
1. Ground every claim in the attached search results. Never invent facts. When \
the sources do not cover something, say so plainly instead of guessing.
2. Cite inline with [N], where N is the number of the source you relied on. \
Every factual claim needs at least one citation.
3. Reason through complex questions step by step: what the evidence says about \
each vendor, where they differ, and what the data does not show.
4. Use exact figures, versions and technical details from the sources.
5. Note when a claim rests on community discussion rather than official \
documentation, and weigh credibility accordingly.
6. Structure longer answers with short sections and bold key terms.";

/// Appended when the model may draw on its own background knowledge.
pub const LLM_KNOWLEDGE_SUPPLEMENT: &str = "\
You may supplement the sources with your own general knowledge. Mark any such \
statement with [LLM knowledge] and never present it as coming from a cited source.";

/// Appended when the web search tool is attached.
pub const WEB_SEARCH_SUPPLEMENT: &str = "\
A web search tool is available. Use it only when the attached sources are \
missing recent or essential information, and cite web results the same way.";

/// Appended when prior turns are part of the prompt.
pub const CONVERSATION_CONTEXT_INSTRUCTION: &str = "\
This is a continuing conversation. Earlier turns are included for context; \
resolve references such as \"they\" or \"that feature\" against them, but ground \
new claims in the current search results.";

/// Appended when retrieval produced no passages.
pub const UNGROUNDED_NOTE: &str = "\
No search results were found for this question. Say clearly that the answer \
is not grounded in the knowledge base and keep any claims appropriately hedged.";

/// Query classification.
pub const ANALYSIS_SYSTEM: &str = r#"You classify questions for a competitive intelligence retrieval system covering capital markets databases (kx, questdb, clickhouse and similar).

Return only a JSON object with these fields:
{
  "intent": "comparison|factual|exploratory|objection_handling",
  "competitors_mentioned": ["short competitor names, e.g. kx, questdb, clickhouse"],
  "topics": ["topic ids relevant to the question"],
  "source_type_hints": ["source types likely to hold the answer, e.g. official_docs, benchmark, blog"],
  "reasoning": "one sentence explaining the classification"
}"#;

/// Hypothetical answer drafting.
pub const HYPOTHETICAL_SYSTEM: &str = "\
Write a short passage of two or three sentences that would directly answer the \
question, in the style of vendor documentation or a technical comparison. It \
does not need to be accurate. Return only the passage.";

/// Sub-question decomposition.
pub const SUB_QUERY_SYSTEM: &str = r#"Break the question into two or three narrower search queries that each cover one facet of it (one vendor, one capability, one metric).

Return only a JSON array of strings, for example:
["query one", "query two"]"#;

/// Follow-up suggestions.
pub const FOLLOWUP_SYSTEM: &str = r#"Suggest concise follow-up questions the user might ask next. They should dig deeper into the topic or explore a related competitive angle.

Return only a JSON array of strings."#;

/// The final user message for the synthesis call.
pub fn synthesis_user_text(query: &str) -> String {
    format!(
        "Question: {query}\n\n\
         Answer using the attached search results. Cite every factual claim inline \
         with [N]. If the results do not cover part of the question, say so."
    )
}

pub fn analysis_user_text(query: &str) -> String {
    format!("Classify this question:\n\n{query}")
}

pub fn sub_query_user_text(query: &str, max: usize) -> String {
    format!("Question: {query}\n\nReturn at most {max} search queries.")
}

pub fn followup_user_text(query: &str, answer_excerpt: &str, count: usize) -> String {
    format!(
        "Original question: {query}\n\nAnswer provided:\n{answer_excerpt}\n\n\
         Suggest {count} follow-up questions."
    )
}

/// Switches that shape the synthesis system text.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPromptOptions<'a> {
    pub persona: Option<&'a str>,
    pub use_llm_knowledge: bool,
    pub web_search: bool,
    pub has_history: bool,
    pub grounded: bool,
}

/// Compose the synthesis system text.
pub fn build_system_text(opts: SystemPromptOptions<'_>) -> String {
    let mut parts: Vec<&str> = vec![SYNTHESIS_SYSTEM];
    if let Some(persona) = opts.persona.map(str::trim).filter(|p| !p.is_empty()) {
        parts.push(persona);
    }
    if opts.use_llm_knowledge {
        parts.push(LLM_KNOWLEDGE_SUPPLEMENT);
    }
    if opts.web_search {
        parts.push(WEB_SEARCH_SUPPLEMENT);
    }
    if opts.has_history {
        parts.push(CONVERSATION_CONTEXT_INSTRUCTION);
    }
    if !opts.grounded {
        parts.push(UNGROUNDED_NOTE);
    }
    parts.join("\n\n")
}

/// Strip a surrounding markdown code fence from a model reply.
pub(crate) fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening fence line.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().trim_end_matches("```").trim()
}

/// Take at most `max_chars` characters without splitting a code point.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
