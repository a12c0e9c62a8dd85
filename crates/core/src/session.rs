//! Session store — the durable, append-only log of conversation turns.
//!
//! Turns are never edited or deleted individually; only whole sessions
//! (or all of an owner's sessions) may be removed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SessionError;
use crate::message::{Message, Role};

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string()[..16].to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One prior turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_id: String,
    pub role: Role,
    pub text: String,
    /// Approximate token cost of `text`.
    pub token_estimate: usize,
    pub created_at: DateTime<Utc>,

    /// Model that produced an assistant turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default)]
    pub tokens_input: u64,
    #[serde(default)]
    pub tokens_output: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl ConversationTurn {
    fn new(role: Role, text: impl Into<String>, token_estimate: usize) -> Self {
        Self {
            turn_id: Uuid::new_v4().to_string(),
            role,
            text: text.into(),
            token_estimate,
            created_at: Utc::now(),
            model: None,
            tokens_input: 0,
            tokens_output: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
        }
    }

    /// Create a user turn.
    pub fn user(text: impl Into<String>, token_estimate: usize) -> Self {
        Self::new(Role::User, text, token_estimate)
    }

    /// Create an assistant turn.
    pub fn assistant(text: impl Into<String>, token_estimate: usize) -> Self {
        Self::new(Role::Assistant, text, token_estimate)
    }

    /// The wire-neutral message for this turn.
    pub fn to_message(&self) -> Message {
        Message {
            role: self.role,
            content: self.text.clone(),
        }
    }
}

/// Summed token counters for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenTotals {
    pub input: u64,
    pub output: u64,
    pub cache_creation: u64,
    pub cache_read: u64,
    pub turn_count: u64,
}

/// A listing entry for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub totals: TokenTotals,
}

/// The core SessionStore trait.
///
/// Implementations: SQLite, in-memory (for testing and ephemeral use).
/// Each `append_turn` is atomic: a turn is either fully stored or absent.
/// `append_exchange` is atomic across both turns and the title, and a call
/// dropped before it resolves stores nothing.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// The backend name (e.g., "sqlite", "in_memory").
    fn name(&self) -> &str;

    /// Create a new empty session owned by `owner`.
    async fn create_session(&self, owner: &str) -> std::result::Result<SessionId, SessionError>;

    /// Append one turn to the end of a session's log.
    async fn append_turn(
        &self,
        session_id: &SessionId,
        turn: ConversationTurn,
    ) -> std::result::Result<(), SessionError>;

    /// Append a user turn and its answer, naming the session with `title`
    /// if it has no title yet.
    async fn append_exchange(
        &self,
        session_id: &SessionId,
        user: ConversationTurn,
        assistant: ConversationTurn,
        title: &str,
    ) -> std::result::Result<(), SessionError>;

    /// The most recent `limit` turns, in chronological order (oldest first).
    async fn recent_turns(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> std::result::Result<Vec<ConversationTurn>, SessionError>;

    /// Every turn of a session, oldest first.
    async fn all_turns(
        &self,
        session_id: &SessionId,
    ) -> std::result::Result<Vec<ConversationTurn>, SessionError>;

    /// Summed token counters across a session's turns.
    async fn session_token_totals(
        &self,
        session_id: &SessionId,
    ) -> std::result::Result<TokenTotals, SessionError>;

    /// An owner's sessions, most recently active first.
    async fn list_sessions(
        &self,
        owner: &str,
        limit: usize,
    ) -> std::result::Result<Vec<SessionSummary>, SessionError>;

    /// Set a session's title if it has none yet.
    async fn set_title_if_empty(
        &self,
        session_id: &SessionId,
        title: &str,
    ) -> std::result::Result<(), SessionError>;

    /// Delete a session and all of its turns. Returns whether it existed.
    async fn delete_session(&self, session_id: &SessionId)
    -> std::result::Result<bool, SessionError>;

    /// Delete every session of an owner. Returns the number deleted.
    async fn delete_owner_sessions(&self, owner: &str) -> std::result::Result<u64, SessionError>;
}
