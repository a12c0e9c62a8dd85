//! SQLite session store.
//!
//! Uses a single SQLite database file with three tables:
//! - `users` — session owners, created implicitly on first session
//! - `sessions` — one row per conversation
//! - `messages` — the append-only turn log, ordered by `seq`
//!
//! Each appended turn is written in its own transaction together with the
//! session's `last_active_at`, so a turn is either fully stored or absent.
//! An exchange (question, answer and first title) shares one transaction.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ciq_core::error::SessionError;
use ciq_core::message::Role;
use ciq_core::session::{ConversationTurn, SessionId, SessionStore, SessionSummary, TokenTotals};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

/// A durable session store backed by SQLite.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

/// Fixed-width timestamps so lexical order matches time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

const TOTALS_SELECT: &str = r#"
    COALESCE(SUM(tokens_input), 0)          AS t_input,
    COALESCE(SUM(tokens_output), 0)         AS t_output,
    COALESCE(SUM(cache_creation_tokens), 0) AS t_cache_creation,
    COALESCE(SUM(cache_read_tokens), 0)     AS t_cache_read,
    COUNT(messages.seq)                     AS t_turns
"#;

impl SqliteSessionStore {
    /// Open (or create) a store at a file path.
    ///
    /// Pass `"sqlite::memory:"` for an in-process ephemeral database.
    pub async fn new(path: &str) -> Result<Self, SessionError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| SessionError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // An in-memory database exists per connection.
        let max_connections = if path.contains(":memory:") { 1 } else { 4 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| SessionError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        info!("SQLite session store initialized at {path}");
        Ok(store)
    }

    /// Open a store at a filesystem path, creating parent directories.
    pub async fn open(path: &std::path::Path) -> Result<Self, SessionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SessionError::Storage(format!("Cannot create {}: {e}", parent.display())))?;
        }
        Self::new(&format!("sqlite://{}", path.display())).await
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, SessionError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), SessionError> {
        let statements = [
            (
                "users table",
                r#"
                CREATE TABLE IF NOT EXISTS users (
                    name        TEXT PRIMARY KEY,
                    created_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "sessions table",
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id              TEXT PRIMARY KEY,
                    owner           TEXT NOT NULL REFERENCES users(name) ON DELETE CASCADE,
                    title           TEXT,
                    created_at      TEXT NOT NULL,
                    last_active_at  TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages table",
                r#"
                CREATE TABLE IF NOT EXISTS messages (
                    seq                    INTEGER PRIMARY KEY AUTOINCREMENT,
                    id                     TEXT UNIQUE NOT NULL,
                    session_id             TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
                    role                   TEXT NOT NULL,
                    content                TEXT NOT NULL,
                    token_estimate         INTEGER NOT NULL DEFAULT 0,
                    model                  TEXT,
                    tokens_input           INTEGER NOT NULL DEFAULT 0,
                    tokens_output          INTEGER NOT NULL DEFAULT 0,
                    cache_creation_tokens  INTEGER NOT NULL DEFAULT 0,
                    cache_read_tokens      INTEGER NOT NULL DEFAULT 0,
                    created_at             TEXT NOT NULL
                )
                "#,
            ),
            (
                "messages index",
                "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, seq)",
            ),
            (
                "sessions index",
                "CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(owner, last_active_at DESC)",
            ),
        ];

        for (what, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .map_err(|e| SessionError::MigrationFailed(format!("{what}: {e}")))?;
        }

        debug!("SQLite migrations complete");
        Ok(())
    }

    async fn ensure_exists(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let row = sqlx::query("SELECT 1 FROM sessions WHERE id = ?1")
            .bind(session_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| SessionError::QueryFailed(format!("session lookup: {e}")))?;
        match row {
            Some(_) => Ok(()),
            None => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    /// Insert one turn and touch its session, inside the caller's transaction.
    async fn write_turn(
        conn: &mut SqliteConnection,
        session_id: &SessionId,
        turn: &ConversationTurn,
    ) -> Result<(), SessionError> {
        let created_at = ts(&turn.created_at);

        let updated = sqlx::query("UPDATE sessions SET last_active_at = MAX(last_active_at, ?2) WHERE id = ?1")
            .bind(session_id.as_str())
            .bind(&created_at)
            .execute(&mut *conn)
            .await
            .map_err(|e| SessionError::Storage(format!("UPDATE session failed: {e}")))?;

        if updated.rows_affected() == 0 {
            return Err(SessionError::NotFound(session_id.to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO messages (
                id, session_id, role, content, token_estimate, model,
                tokens_input, tokens_output, cache_creation_tokens, cache_read_tokens, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&turn.turn_id)
        .bind(session_id.as_str())
        .bind(turn.role.as_str())
        .bind(&turn.text)
        .bind(turn.token_estimate as i64)
        .bind(&turn.model)
        .bind(turn.tokens_input as i64)
        .bind(turn.tokens_output as i64)
        .bind(turn.cache_creation_tokens as i64)
        .bind(turn.cache_read_tokens as i64)
        .bind(&created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| SessionError::Storage(format!("INSERT message failed: {e}")))?;

        Ok(())
    }

    fn row_to_turn(row: &SqliteRow) -> Result<ConversationTurn, SessionError> {
        let col = |name: &str, e: sqlx::Error| SessionError::QueryFailed(format!("{name} column: {e}"));

        let role_str: String = row.try_get("role").map_err(|e| col("role", e))?;
        let role = Role::from_str(&role_str).map_err(SessionError::QueryFailed)?;
        let created_at: String = row.try_get("created_at").map_err(|e| col("created_at", e))?;
        let token_estimate: i64 = row.try_get("token_estimate").map_err(|e| col("token_estimate", e))?;
        let get_u64 = |name: &str| -> Result<u64, SessionError> {
            let v: i64 = row.try_get(name).map_err(|e| col(name, e))?;
            Ok(v.max(0) as u64)
        };

        Ok(ConversationTurn {
            turn_id: row.try_get("id").map_err(|e| col("id", e))?,
            role,
            text: row.try_get("content").map_err(|e| col("content", e))?,
            token_estimate: token_estimate.max(0) as usize,
            created_at: parse_ts(&created_at),
            model: row.try_get("model").map_err(|e| col("model", e))?,
            tokens_input: get_u64("tokens_input")?,
            tokens_output: get_u64("tokens_output")?,
            cache_creation_tokens: get_u64("cache_creation_tokens")?,
            cache_read_tokens: get_u64("cache_read_tokens")?,
        })
    }

    fn row_to_totals(row: &SqliteRow) -> Result<TokenTotals, SessionError> {
        let get = |name: &str| -> Result<u64, SessionError> {
            let v: i64 = row
                .try_get(name)
                .map_err(|e| SessionError::QueryFailed(format!("{name} column: {e}")))?;
            Ok(v.max(0) as u64)
        };
        Ok(TokenTotals {
            input: get("t_input")?,
            output: get("t_output")?,
            cache_creation: get("t_cache_creation")?,
            cache_read: get("t_cache_read")?,
            turn_count: get("t_turns")?,
        })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn create_session(&self, owner: &str) -> Result<SessionId, SessionError> {
        let id = SessionId::new();
        let now = ts(&Utc::now());

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SessionError::Storage(format!("BEGIN failed: {e}")))?;

        sqlx::query("INSERT OR IGNORE INTO users (name, created_at) VALUES (?1, ?2)")
            .bind(owner)
            .bind(&now)
            .execute(&mut *tx)
            .await
            .map_err(|e| SessionError::Storage(format!("INSERT user failed: {e}")))?;

        sqlx::query(
            "INSERT INTO sessions (id, owner, title, created_at, last_active_at) VALUES (?1, ?2, NULL, ?3, ?3)",
        )
        .bind(id.as_str())
        .bind(owner)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| SessionError::Storage(format!("INSERT session failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| SessionError::Storage(format!("COMMIT failed: {e}")))?;

        debug!(session_id = %id, owner, "Created session");
        Ok(id)
    }

    async fn append_turn(&self, session_id: &SessionId, turn: ConversationTurn) -> Result<(), SessionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SessionError::Storage(format!("BEGIN failed: {e}")))?;

        // Dropping the transaction on error rolls it back.
        Self::write_turn(&mut tx, session_id, &turn).await?;

        tx.commit()
            .await
            .map_err(|e| SessionError::Storage(format!("COMMIT failed: {e}")))?;

        debug!(session_id = %session_id, role = %turn.role, "Appended turn");
        Ok(())
    }

    async fn append_exchange(
        &self,
        session_id: &SessionId,
        user: ConversationTurn,
        assistant: ConversationTurn,
        title: &str,
    ) -> Result<(), SessionError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SessionError::Storage(format!("BEGIN failed: {e}")))?;

        Self::write_turn(&mut tx, session_id, &user).await?;
        Self::write_turn(&mut tx, session_id, &assistant).await?;

        sqlx::query("UPDATE sessions SET title = ?2 WHERE id = ?1 AND (title IS NULL OR title = '')")
            .bind(session_id.as_str())
            .bind(title)
            .execute(&mut *tx)
            .await
            .map_err(|e| SessionError::Storage(format!("UPDATE title failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| SessionError::Storage(format!("COMMIT failed: {e}")))?;

        debug!(session_id = %session_id, "Appended exchange");
        Ok(())
    }

    async fn recent_turns(&self, session_id: &SessionId, limit: usize) -> Result<Vec<ConversationTurn>, SessionError> {
        self.ensure_exists(session_id).await?;

        let rows = sqlx::query(
            r#"
            SELECT * FROM (
                SELECT * FROM messages WHERE session_id = ?1 ORDER BY seq DESC LIMIT ?2
            ) ORDER BY seq ASC
            "#,
        )
        .bind(session_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SessionError::QueryFailed(format!("recent turns: {e}")))?;

        rows.iter().map(Self::row_to_turn).collect()
    }

    async fn all_turns(&self, session_id: &SessionId) -> Result<Vec<ConversationTurn>, SessionError> {
        self.ensure_exists(session_id).await?;

        let rows = sqlx::query("SELECT * FROM messages WHERE session_id = ?1 ORDER BY seq ASC")
            .bind(session_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SessionError::QueryFailed(format!("all turns: {e}")))?;

        rows.iter().map(Self::row_to_turn).collect()
    }

    async fn session_token_totals(&self, session_id: &SessionId) -> Result<TokenTotals, SessionError> {
        self.ensure_exists(session_id).await?;

        let sql = format!("SELECT {TOTALS_SELECT} FROM messages WHERE session_id = ?1");
        let row = sqlx::query(&sql)
            .bind(session_id.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SessionError::QueryFailed(format!("token totals: {e}")))?;

        Self::row_to_totals(&row)
    }

    async fn list_sessions(&self, owner: &str, limit: usize) -> Result<Vec<SessionSummary>, SessionError> {
        let sql = format!(
            r#"
            SELECT sessions.id, sessions.owner, sessions.title,
                   sessions.created_at, sessions.last_active_at,
                   {TOTALS_SELECT}
            FROM sessions
            LEFT JOIN messages ON messages.session_id = sessions.id
            WHERE sessions.owner = ?1
            GROUP BY sessions.id
            ORDER BY sessions.last_active_at DESC, sessions.id ASC
            LIMIT ?2
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(owner)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SessionError::QueryFailed(format!("list sessions: {e}")))?;

        rows.iter()
            .map(|row| {
                let col = |name: &str, e: sqlx::Error| SessionError::QueryFailed(format!("{name} column: {e}"));
                let id: String = row.try_get("id").map_err(|e| col("id", e))?;
                let created_at: String = row.try_get("created_at").map_err(|e| col("created_at", e))?;
                let last_active_at: String = row.try_get("last_active_at").map_err(|e| col("last_active_at", e))?;
                Ok(SessionSummary {
                    session_id: SessionId(id),
                    owner: row.try_get("owner").map_err(|e| col("owner", e))?,
                    title: row.try_get("title").map_err(|e| col("title", e))?,
                    created_at: parse_ts(&created_at),
                    last_active_at: parse_ts(&last_active_at),
                    totals: Self::row_to_totals(row)?,
                })
            })
            .collect()
    }

    async fn set_title_if_empty(&self, session_id: &SessionId, title: &str) -> Result<(), SessionError> {
        self.ensure_exists(session_id).await?;

        sqlx::query("UPDATE sessions SET title = ?2 WHERE id = ?1 AND (title IS NULL OR title = '')")
            .bind(session_id.as_str())
            .bind(title)
            .execute(&self.pool)
            .await
            .map_err(|e| SessionError::Storage(format!("UPDATE title failed: {e}")))?;
        Ok(())
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<bool, SessionError> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SessionError::Storage(format!("DELETE failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_owner_sessions(&self, owner: &str) -> Result<u64, SessionError> {
        let result = sqlx::query("DELETE FROM sessions WHERE owner = ?1")
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(|e| SessionError::Storage(format!("DELETE owner sessions failed: {e}")))?;

        Ok(result.rows_affected())
    }
}
