//! History compaction.
//!
//! Selects the contiguous most-recent run of prior turns that fits the
//! history token budget. Walking newest to oldest, a turn is included only
//! if it fits; the first turn that does not fit ends the walk, so no older
//! turn is ever included after a gap. The most recent turn is always kept,
//! even when it alone exceeds the budget.

use ciq_config::HistoryConfig;
use ciq_core::error::SessionError;
use ciq_core::session::{ConversationTurn, SessionId, SessionStore};
use serde::{Deserialize, Serialize};

use super::token::TokenEstimator;

/// The turns selected for one prompt, in chronological order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactedHistory {
    pub turns: Vec<ConversationTurn>,
    /// Estimated tokens of `turns`.
    pub tokens: usize,
    /// Turns fetched from the store before compaction.
    pub considered: usize,
}

impl CompactedHistory {
    pub fn included(&self) -> usize {
        self.turns.len()
    }

    pub fn dropped(&self) -> usize {
        self.considered - self.turns.len()
    }
}

/// Budget-bounded selection of recent turns.
#[derive(Debug, Clone)]
pub struct HistoryCompactor {
    budget_tokens: usize,
    max_turns: usize,
    estimator: TokenEstimator,
}

impl HistoryCompactor {
    pub fn new(budget_tokens: usize, max_turns: usize, estimator: TokenEstimator) -> Self {
        Self {
            budget_tokens,
            max_turns,
            estimator,
        }
    }

    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::new(
            config.budget_tokens,
            config.max_turns,
            TokenEstimator::new(config.chars_per_token),
        )
    }

    /// Replace the budget for a single request.
    pub fn with_budget(mut self, budget_tokens: usize) -> Self {
        self.budget_tokens = budget_tokens;
        self
    }

    pub fn budget_tokens(&self) -> usize {
        self.budget_tokens
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Compact chronologically ordered turns.
    pub fn compact(&self, recent: &[ConversationTurn]) -> CompactedHistory {
        let window = &recent[recent.len().saturating_sub(self.max_turns)..];

        let mut tokens = 0usize;
        let mut kept = 0usize;
        for turn in window.iter().rev() {
            let cost = self.estimator.turn_tokens(turn);
            if kept > 0 && tokens + cost > self.budget_tokens {
                break;
            }
            tokens += cost;
            kept += 1;
        }

        CompactedHistory {
            turns: window[window.len() - kept..].to_vec(),
            tokens,
            considered: window.len(),
        }
    }

    /// Fetch the most recent `max_turns` turns of a session and compact them.
    pub async fn load(
        &self,
        store: &dyn SessionStore,
        session_id: &SessionId,
    ) -> Result<CompactedHistory, SessionError> {
        if self.max_turns == 0 {
            return Ok(CompactedHistory::default());
        }
        let recent = store.recent_turns(session_id, self.max_turns).await?;
        Ok(self.compact(&recent))
    }
}
