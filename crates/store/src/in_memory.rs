//! In-memory session store — useful for testing and ephemeral sessions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ciq_core::error::SessionError;
use ciq_core::session::{ConversationTurn, SessionId, SessionStore, SessionSummary, TokenTotals};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct SessionRecord {
    owner: String,
    title: Option<String>,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
    turns: Vec<ConversationTurn>,
}

impl SessionRecord {
    fn totals(&self) -> TokenTotals {
        self.turns.iter().fold(TokenTotals::default(), |mut t, turn| {
            t.input += turn.tokens_input;
            t.output += turn.tokens_output;
            t.cache_creation += turn.cache_creation_tokens;
            t.cache_read += turn.cache_read_tokens;
            t.turn_count += 1;
            t
        })
    }
}

/// A session store that keeps every session in a map.
/// Nothing survives the process.
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionId, SessionRecord>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(id: &SessionId) -> SessionError {
    SessionError::NotFound(id.to_string())
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_session(&self, owner: &str) -> Result<SessionId, SessionError> {
        let id = SessionId::new();
        let now = Utc::now();
        self.sessions.write().await.insert(
            id.clone(),
            SessionRecord {
                owner: owner.to_string(),
                title: None,
                created_at: now,
                last_active_at: now,
                turns: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn append_turn(
        &self,
        session_id: &SessionId,
        turn: ConversationTurn,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        record.last_active_at = turn.created_at.max(record.last_active_at);
        record.turns.push(turn);
        Ok(())
    }

    async fn append_exchange(
        &self,
        session_id: &SessionId,
        user: ConversationTurn,
        assistant: ConversationTurn,
        title: &str,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        record.last_active_at = assistant.created_at.max(user.created_at).max(record.last_active_at);
        record.turns.push(user);
        record.turns.push(assistant);
        if record.title.as_deref().is_none_or(str::is_empty) {
            record.title = Some(title.to_string());
        }
        Ok(())
    }

    async fn recent_turns(
        &self,
        session_id: &SessionId,
        limit: usize,
    ) -> Result<Vec<ConversationTurn>, SessionError> {
        let sessions = self.sessions.read().await;
        let record = sessions.get(session_id).ok_or_else(|| not_found(session_id))?;
        let start = record.turns.len().saturating_sub(limit);
        Ok(record.turns[start..].to_vec())
    }

    async fn all_turns(&self, session_id: &SessionId) -> Result<Vec<ConversationTurn>, SessionError> {
        let sessions = self.sessions.read().await;
        let record = sessions.get(session_id).ok_or_else(|| not_found(session_id))?;
        Ok(record.turns.clone())
    }

    async fn session_token_totals(&self, session_id: &SessionId) -> Result<TokenTotals, SessionError> {
        let sessions = self.sessions.read().await;
        let record = sessions.get(session_id).ok_or_else(|| not_found(session_id))?;
        Ok(record.totals())
    }

    async fn list_sessions(&self, owner: &str, limit: usize) -> Result<Vec<SessionSummary>, SessionError> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .filter(|(_, r)| r.owner == owner)
            .map(|(id, r)| SessionSummary {
                session_id: id.clone(),
                owner: r.owner.clone(),
                title: r.title.clone(),
                created_at: r.created_at,
                last_active_at: r.last_active_at,
                totals: r.totals(),
            })
            .collect();

        summaries.sort_by(|a, b| {
            b.last_active_at
                .cmp(&a.last_active_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn set_title_if_empty(&self, session_id: &SessionId, title: &str) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().await;
        let record = sessions.get_mut(session_id).ok_or_else(|| not_found(session_id))?;
        if record.title.as_deref().is_none_or(str::is_empty) {
            record.title = Some(title.to_string());
        }
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<bool, SessionError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }

    async fn delete_owner_sessions(&self, owner: &str) -> Result<u64, SessionError> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, r| r.owner != owner);
        Ok((before - sessions.len()) as u64)
    }
}
