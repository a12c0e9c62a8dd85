//! Prompt assembly.
//!
//! Packs a [`PromptPlan`] from the compacted history, the fused passages and
//! the user text under one total token budget:
//!
//! 1. **User text** is always included.
//! 2. **History** arrives already compacted. If it still does not fit next
//!    to the user text, its oldest turns are dropped until it does, so the
//!    kept turns stay a contiguous most-recent run.
//! 3. **Passages** fill what remains, in fused-rank order; the first passage
//!    that does not fit ends packing, so included passages are a prefix of
//!    the ranking.
//!
//! Only user text that alone exceeds the budget fails assembly, with
//! [`AssemblyError::UserTextExceedsBudget`].
//!
//! The fast-mode override is applied here: fast mode selects the fast model
//! and its output limit and forces reasoning off, whatever the request asked.
//!
//! Assembly is deterministic: identical inputs produce identical plans.

use ciq_config::AppConfig;
use ciq_core::message::Message;
use ciq_core::passage::FusedResult;
use ciq_core::provider::{ProviderRequest, SourceDocument};
use ciq_core::session::ConversationTurn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::history::CompactedHistory;
use super::token::TokenEstimator;
use crate::citations::source_document;
use crate::prompts::{SystemPromptOptions, build_system_text, synthesis_user_text};

// ── Types ─────────────────────────────────────────────────────────────────

/// Everything the assembler needs for one query.
#[derive(Debug, Clone)]
pub struct AssemblyInput<'a> {
    pub query: &'a str,
    pub history: CompactedHistory,
    /// Fused passages in rank order.
    pub passages: Vec<FusedResult>,
    pub fast_mode: bool,
    pub reasoning_requested: bool,
}

/// The fully determined input of the generation call.
#[derive(Debug, Clone)]
pub struct PromptPlan {
    pub system_text: String,
    pub included_turns: Vec<ConversationTurn>,
    pub passages: Vec<FusedResult>,
    pub user_text: String,
    pub model: String,
    pub reasoning_enabled: bool,
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub web_search: bool,
    pub fast_mode: bool,
    pub stats: PlanStats,
}

/// Token accounting for one plan.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanStats {
    pub budget: usize,
    pub history_turns: usize,
    pub history_tokens: usize,
    pub passages_available: usize,
    pub passages_included: usize,
    pub passage_tokens: usize,
    pub user_tokens: usize,
    pub total_tokens: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drops: Vec<DropInfo>,
}

/// Items left out of a layer during budget enforcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropInfo {
    pub layer: String,
    pub items_dropped: usize,
    pub tokens_dropped: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Error)]
pub enum AssemblyError {
    #[error("user text ({user_tokens} tokens) exceeds the prompt budget ({budget} tokens)")]
    UserTextExceedsBudget { user_tokens: usize, budget: usize },
}

impl PromptPlan {
    /// Documents for the passages, in plan order.
    pub fn documents(&self) -> Vec<SourceDocument> {
        self.passages.iter().map(source_document).collect()
    }

    /// The generation request this plan fully determines.
    pub fn to_request(&self) -> ProviderRequest {
        let mut messages: Vec<Message> = self.included_turns.iter().map(ConversationTurn::to_message).collect();
        messages.push(Message::user(self.user_text.clone()));

        ProviderRequest {
            model: self.model.clone(),
            system: self.system_text.clone(),
            messages,
            documents: self.documents(),
            temperature: self.temperature,
            max_tokens: self.max_output_tokens,
            reasoning: self.reasoning_enabled,
            web_search: self.web_search,
            memory_tool: false,
            tool_rounds: Vec::new(),
        }
    }
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// Builds prompt plans. Stateless; create one and reuse it.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    total_budget: usize,
    estimator: TokenEstimator,
    model: String,
    fast_model: String,
    max_output_tokens: u32,
    fast_max_output_tokens: u32,
    temperature: f32,
    web_search: bool,
    persona: Option<String>,
    use_llm_knowledge: bool,
}

impl PromptAssembler {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            total_budget: config.prompt.total_budget_tokens,
            estimator: TokenEstimator::new(config.history.chars_per_token),
            model: config.generation.model.clone(),
            fast_model: config.generation.fast_model.clone(),
            max_output_tokens: config.generation.max_output_tokens,
            fast_max_output_tokens: config.generation.fast_max_output_tokens,
            temperature: config.generation.temperature,
            web_search: config.generation.web_search,
            persona: config.prompt.persona.clone(),
            use_llm_knowledge: config.prompt.use_llm_knowledge,
        }
    }

    pub fn total_budget(&self) -> usize {
        self.total_budget
    }

    /// Tokens left for history once the user text for `query` is counted.
    ///
    /// The orchestrator caps the history budget with this, whatever the
    /// request asked for.
    pub fn history_allowance(&self, query: &str) -> usize {
        let user_tokens = self.estimator.estimate(&synthesis_user_text(query));
        self.total_budget.saturating_sub(user_tokens)
    }

    /// Estimated cost of one passage as a document.
    pub fn passage_tokens(&self, passage: &FusedResult) -> usize {
        let doc = source_document(passage);
        self.estimator.estimate(&doc.text) + self.estimator.estimate(&doc.title)
    }

    pub fn assemble(&self, input: AssemblyInput<'_>) -> Result<PromptPlan, AssemblyError> {
        let user_text = synthesis_user_text(input.query);
        let user_tokens = self.estimator.estimate(&user_text);
        if user_tokens > self.total_budget {
            return Err(AssemblyError::UserTextExceedsBudget {
                user_tokens,
                budget: self.total_budget,
            });
        }

        let mut history = input.history;
        let mut trimmed_turns = 0;
        let mut trimmed_tokens = 0;
        while history.tokens + user_tokens > self.total_budget && !history.turns.is_empty() {
            let oldest = history.turns.remove(0);
            let cost = self.estimator.turn_tokens(&oldest);
            history.tokens = history.tokens.saturating_sub(cost);
            trimmed_turns += 1;
            trimmed_tokens += cost;
        }
        if history.turns.is_empty() {
            history.tokens = 0;
        }
        let history_tokens = history.tokens;

        let fixed = history_tokens + user_tokens;
        let mut remaining = self.total_budget - fixed;
        let passages_available = input.passages.len();
        let mut passage_tokens = 0;
        let mut included = Vec::with_capacity(passages_available);
        let mut dropped_tokens = 0;

        let mut iter = input.passages.into_iter();
        for passage in iter.by_ref() {
            let cost = self.passage_tokens(&passage);
            if cost > remaining {
                dropped_tokens += cost;
                break;
            }
            remaining -= cost;
            passage_tokens += cost;
            included.push(passage);
        }
        dropped_tokens += iter.map(|p| self.passage_tokens(&p)).sum::<usize>();

        let mut drops = Vec::new();
        if included.len() < passages_available {
            drops.push(DropInfo {
                layer: "passages".into(),
                items_dropped: passages_available - included.len(),
                tokens_dropped: dropped_tokens,
                reason: "Prompt budget exceeded".into(),
            });
        }
        let compacted_away = history.considered.saturating_sub(history.turns.len() + trimmed_turns);
        if compacted_away > 0 {
            drops.push(DropInfo {
                layer: "history".into(),
                items_dropped: compacted_away,
                tokens_dropped: 0,
                reason: "History budget exceeded".into(),
            });
        }
        if trimmed_turns > 0 {
            drops.push(DropInfo {
                layer: "history".into(),
                items_dropped: trimmed_turns,
                tokens_dropped: trimmed_tokens,
                reason: "Prompt budget exceeded".into(),
            });
        }

        let fast_mode = input.fast_mode;
        let reasoning_enabled = input.reasoning_requested && !fast_mode;
        let (model, max_output_tokens) = if fast_mode {
            (self.fast_model.clone(), self.fast_max_output_tokens)
        } else {
            (self.model.clone(), self.max_output_tokens)
        };

        let system_text = build_system_text(SystemPromptOptions {
            persona: self.persona.as_deref(),
            use_llm_knowledge: self.use_llm_knowledge,
            web_search: self.web_search,
            has_history: !history.turns.is_empty(),
            grounded: !included.is_empty(),
        });

        let stats = PlanStats {
            budget: self.total_budget,
            history_turns: history.turns.len(),
            history_tokens,
            passages_available,
            passages_included: included.len(),
            passage_tokens,
            user_tokens,
            total_tokens: fixed + passage_tokens,
            drops,
        };

        Ok(PromptPlan {
            system_text,
            included_turns: history.turns,
            passages: included,
            user_text,
            model,
            reasoning_enabled,
            max_output_tokens,
            temperature: self.temperature,
            web_search: self.web_search,
            fast_mode,
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::{CONVERSATION_CONTEXT_INSTRUCTION, UNGROUNDED_NOTE};
    use crate::test_helpers::fused;
    use serde_json::json;

    fn assembler(budget: usize) -> PromptAssembler {
        let mut config = AppConfig::default();
        config.prompt.total_budget_tokens = budget;
        PromptAssembler::new(&config)
    }

    fn passage(id: &str, chars: usize) -> FusedResult {
        let mut p = fused(id, json!({}));
        p.text = "x".repeat(chars);
        p
    }

    fn input(passages: Vec<FusedResult>) -> AssemblyInput<'static> {
        AssemblyInput {
            query: "How does kdb+ ingest compare to QuestDB?",
            history: CompactedHistory::default(),
            passages,
            fast_mode: false,
            reasoning_requested: true,
        }
    }

    #[test]
    fn everything_fits() {
        let plan = assembler(10_000)
            .assemble(input(vec![passage("a", 400), passage("b", 400)]))
            .unwrap();
        assert_eq!(plan.passages.len(), 2);
        assert!(plan.stats.drops.is_empty());
        assert!(plan.stats.total_tokens <= plan.stats.budget);
        assert!(plan.reasoning_enabled);
        assert!(!plan.system_text.contains(UNGROUNDED_NOTE));
    }

    #[test]
    fn passages_packed_as_rank_prefix() {
        let a = assembler(10_000);
        let user = a.estimator.estimate(&synthesis_user_text(input(vec![]).query));
        let costs = a.passage_tokens(&passage("a", 400));
        let budget = user + costs * 2 + 1;
        let plan = assembler(budget)
            .assemble(input(vec![
                passage("a", 400),
                passage("b", 400),
                passage("c", 40),
                passage("d", 400),
            ]))
            .unwrap();
        let ids: Vec<_> = plan.passages.iter().map(|p| p.id.as_str()).collect();
        // "c" would fit on its own but packing stops at the first miss.
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(plan.stats.drops[0].items_dropped, 2);
        assert!(plan.stats.total_tokens <= budget);
    }

    #[test]
    fn oversized_history_loses_oldest_turns() {
        let mut i = input(vec![passage("a", 40)]);
        i.history = CompactedHistory {
            turns: vec![
                ConversationTurn::user("old q", 400),
                ConversationTurn::assistant("old a", 400),
                ConversationTurn::user("new q", 300),
            ],
            tokens: 1100,
            considered: 3,
        };
        let plan = assembler(1000).assemble(i).unwrap();

        let kept: Vec<_> = plan.included_turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(kept, vec!["old a", "new q"]);
        assert_eq!(plan.stats.history_tokens, 700);
        assert!(plan.stats.total_tokens <= 1000);
        let trim = plan.stats.drops.iter().find(|d| d.reason == "Prompt budget exceeded" && d.layer == "history");
        assert_eq!(trim.map(|d| (d.items_dropped, d.tokens_dropped)), Some((1, 400)));
    }

    #[test]
    fn single_oversized_turn_is_dropped_entirely() {
        let mut i = input(vec![]);
        i.history = CompactedHistory {
            turns: vec![ConversationTurn::user("q", 5000)],
            tokens: 5000,
            considered: 1,
        };
        let plan = assembler(1000).assemble(i).unwrap();
        assert!(plan.included_turns.is_empty());
        assert_eq!(plan.stats.history_tokens, 0);
        assert!(!plan.system_text.contains(CONVERSATION_CONTEXT_INSTRUCTION));
        assert_eq!(plan.to_request().messages.len(), 1);
    }

    #[test]
    fn user_text_over_budget_is_an_error() {
        let long = "kdb+ ".repeat(2000);
        let i = AssemblyInput {
            query: &long,
            history: CompactedHistory::default(),
            passages: vec![],
            fast_mode: false,
            reasoning_requested: true,
        };
        let err = assembler(100).assemble(i).unwrap_err();
        assert!(matches!(err, AssemblyError::UserTextExceedsBudget { budget: 100, .. }));
    }

    #[test]
    fn history_allowance_leaves_room_for_user_text() {
        let a = assembler(1000);
        let query = "How does kdb+ ingest compare to QuestDB?";
        let user = a.estimator.estimate(&synthesis_user_text(query));
        assert_eq!(a.history_allowance(query), 1000 - user);
        assert_eq!(assembler(1).history_allowance(query), 0);
    }

    #[test]
    fn zero_passages_and_history_is_valid() {
        let plan = assembler(1000).assemble(input(vec![])).unwrap();
        assert!(plan.passages.is_empty());
        assert!(plan.system_text.contains(UNGROUNDED_NOTE));
        assert_eq!(plan.to_request().messages.len(), 1);
    }

    #[test]
    fn fast_mode_overrides_reasoning_and_model() {
        let mut i = input(vec![]);
        i.fast_mode = true;
        i.reasoning_requested = true;
        let plan = assembler(1000).assemble(i).unwrap();
        let defaults = AppConfig::default();
        assert!(!plan.reasoning_enabled);
        assert_eq!(plan.model, defaults.generation.fast_model);
        assert_eq!(plan.max_output_tokens, defaults.generation.fast_max_output_tokens);
    }

    #[test]
    fn request_carries_history_then_user_text() {
        let mut i = input(vec![passage("a", 40)]);
        i.history = CompactedHistory {
            turns: vec![
                ConversationTurn::user("earlier q", 3),
                ConversationTurn::assistant("earlier a", 3),
            ],
            tokens: 6,
            considered: 2,
        };
        let plan = assembler(1000).assemble(i).unwrap();
        assert!(plan.system_text.contains(CONVERSATION_CONTEXT_INSTRUCTION));

        let req = plan.to_request();
        assert_eq!(req.messages.len(), 3);
        assert_eq!(req.messages[0].content, "earlier q");
        assert!(req.messages[2].content.starts_with("Question: "));
        assert_eq!(req.documents.len(), 1);
        assert_eq!(req.documents[0].source, "vectordb://a");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn plan_never_exceeds_budget(
                history_costs in proptest::collection::vec(1usize..2000, 0..8),
                passage_chars in proptest::collection::vec(1usize..4000, 0..12),
                budget in 200usize..6000,
            ) {
                let turns: Vec<_> = history_costs
                    .iter()
                    .map(|&c| ConversationTurn::user("earlier", c))
                    .collect();
                let mut i = input(passage_chars.iter().enumerate().map(|(n, &c)| passage(&format!("p{n}"), c)).collect());
                i.history = CompactedHistory {
                    tokens: history_costs.iter().sum(),
                    considered: turns.len(),
                    turns,
                };

                let plan = assembler(budget).assemble(i).unwrap();
                prop_assert!(plan.stats.total_tokens <= budget);
                prop_assert_eq!(
                    plan.stats.total_tokens,
                    plan.stats.history_tokens + plan.stats.passage_tokens + plan.stats.user_tokens
                );
                prop_assert_eq!(plan.included_turns.len(), plan.stats.history_turns);
            }
        }
    }
}
