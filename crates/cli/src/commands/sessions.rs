//! `ciq sessions` — manage the conversation log.

use anyhow::bail;
use ciq_core::session::{ConversationTurn, SessionId, SessionStore, SessionSummary, TokenTotals};

use crate::SessionCommand;
use crate::runtime;

pub async fn run(command: SessionCommand) -> anyhow::Result<()> {
    let config = runtime::load_config()?;
    if config.sessions.backend == "memory" {
        bail!("sessions.backend is \"memory\": nothing outlives a single command");
    }
    let store = runtime::session_store(&config).await?;
    let owner = config.sessions.owner.as_str();
    execute(store.as_ref(), owner, command).await
}

async fn execute(store: &dyn SessionStore, owner: &str, command: SessionCommand) -> anyhow::Result<()> {
    match command {
        SessionCommand::New => {
            let id = store.create_session(owner).await?;
            println!("{id}");
        }
        SessionCommand::List { limit } => {
            let sessions = store.list_sessions(owner, limit).await?;
            if sessions.is_empty() {
                println!("No sessions for '{owner}'.");
            }
            for summary in &sessions {
                println!("{}", summary_line(summary));
            }
        }
        SessionCommand::Show { id, json } => {
            let turns = store.all_turns(&SessionId::from(&id)).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&turns)?);
            } else {
                for turn in &turns {
                    println!("{}", turn_block(turn));
                }
            }
        }
        SessionCommand::Totals { id } => {
            let totals = store.session_token_totals(&SessionId::from(&id)).await?;
            println!("{}", totals_block(&totals));
        }
        SessionCommand::Delete { id: Some(id), .. } => {
            if store.delete_session(&SessionId::from(&id)).await? {
                println!("Deleted {id}");
            } else {
                bail!("No session {id}");
            }
        }
        SessionCommand::Delete { id: None, .. } => {
            let removed = store.delete_owner_sessions(owner).await?;
            println!("Deleted {removed} session(s) for '{owner}'");
        }
    }
    Ok(())
}

fn summary_line(summary: &SessionSummary) -> String {
    format!(
        "{}  {}  {:>3} turns  {:>8} tokens  {}",
        summary.session_id,
        summary.last_active_at.format("%Y-%m-%d %H:%M"),
        summary.totals.turn_count,
        summary.totals.input + summary.totals.output,
        summary.title.as_deref().unwrap_or("(untitled)"),
    )
}

fn turn_block(turn: &ConversationTurn) -> String {
    let who = match &turn.model {
        Some(model) => format!("{} ({model})", turn.role),
        None => turn.role.to_string(),
    };
    format!("[{}] {who}\n{}\n", turn.created_at.format("%Y-%m-%d %H:%M:%S"), turn.text)
}

fn totals_block(totals: &TokenTotals) -> String {
    format!(
        "turns:          {}\ninput:          {}\noutput:         {}\ncache creation: {}\ncache read:     {}",
        totals.turn_count, totals.input, totals.output, totals.cache_creation, totals.cache_read
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciq_store::InMemorySessionStore;

    #[tokio::test]
    async fn delete_all_is_owner_scoped() {
        let store = InMemorySessionStore::new();
        store.create_session("ana").await.unwrap();
        store.create_session("ana").await.unwrap();
        let other = store.create_session("ben").await.unwrap();

        execute(&store, "ana", SessionCommand::Delete { id: None, all: true })
            .await
            .unwrap();

        assert!(store.list_sessions("ana", 10).await.unwrap().is_empty());
        assert!(store.all_turns(&other).await.is_ok());
    }

    #[tokio::test]
    async fn deleting_unknown_session_fails() {
        let store = InMemorySessionStore::new();
        let result = execute(
            &store,
            "ana",
            SessionCommand::Delete {
                id: Some("missing".into()),
                all: false,
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn turn_rendering_names_the_model() {
        let mut turn = ConversationTurn::assistant("kdb+ is columnar.", 5);
        turn.model = Some("claude-sonnet-4-6".into());
        let block = turn_block(&turn);
        assert!(block.contains("assistant (claude-sonnet-4-6)"));
        assert!(block.contains("kdb+ is columnar."));
    }

    #[test]
    fn totals_rendering() {
        let totals = TokenTotals {
            input: 1200,
            output: 80,
            cache_creation: 0,
            cache_read: 900,
            turn_count: 2,
        };
        let block = totals_block(&totals);
        assert!(block.contains("input:          1200"));
        assert!(block.contains("cache read:     900"));
    }
}
