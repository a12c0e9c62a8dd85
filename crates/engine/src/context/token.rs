//! Token estimation.
//!
//! A character-count heuristic with a configurable chars-per-token ratio.
//! Counts `char`s rather than bytes so non-ASCII text is not over-charged.

use ciq_core::session::ConversationTurn;

/// The ratio used when none is configured.
pub const DEFAULT_CHARS_PER_TOKEN: f32 = 4.0;

/// Estimates token counts from text length.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenEstimator {
    chars_per_token: f32,
}

impl TokenEstimator {
    /// Non-positive or non-finite ratios fall back to the default.
    pub fn new(chars_per_token: f32) -> Self {
        let chars_per_token = if chars_per_token.is_finite() && chars_per_token > 0.0 {
            chars_per_token
        } else {
            DEFAULT_CHARS_PER_TOKEN
        };
        Self { chars_per_token }
    }

    pub fn chars_per_token(&self) -> f32 {
        self.chars_per_token
    }

    /// Estimate the token count for a string. Rounds up.
    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        let chars = text.chars().count() as f32;
        (chars / self.chars_per_token).ceil() as usize
    }

    /// The stored estimate of a turn, or a fresh one when it was never set.
    pub fn turn_tokens(&self, turn: &ConversationTurn) -> usize {
        if turn.token_estimate > 0 {
            turn.token_estimate
        } else {
            self.estimate(&turn.text)
        }
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}

/// Estimate with the default ratio.
pub fn estimate_tokens(text: &str) -> usize {
    TokenEstimator::default().estimate(text)
}
