//! Query rewriting for the model-assisted strategies.

use std::time::Duration;

use ciq_core::provider::{Provider, ProviderRequest};

use crate::auxiliary::{AuxiliaryError, complete_json, complete_text};
use crate::prompts::{HYPOTHETICAL_SYSTEM, SUB_QUERY_SYSTEM, sub_query_user_text};

/// Draft a short hypothetical answer whose embedding stands in for the query.
pub async fn hypothetical_passage(
    provider: &dyn Provider,
    model: &str,
    query: &str,
    deadline: Duration,
) -> Result<String, AuxiliaryError> {
    let request = ProviderRequest::simple(model, HYPOTHETICAL_SYSTEM, query, 0.3, 300);
    let passage = complete_text(provider, request, deadline).await?;
    let passage = passage.trim();
    if passage.is_empty() {
        return Err(AuxiliaryError::Malformed("empty hypothetical passage".into()));
    }
    Ok(passage.to_string())
}

/// Decompose the query into at most `max` narrower search queries.
///
/// Blank and repeated entries are dropped.
pub async fn sub_queries(
    provider: &dyn Provider,
    model: &str,
    query: &str,
    max: usize,
    deadline: Duration,
) -> Result<Vec<String>, AuxiliaryError> {
    let request = ProviderRequest::simple(model, SUB_QUERY_SYSTEM, sub_query_user_text(query, max), 0.2, 300);
    let raw: Vec<String> = complete_json(provider, request, deadline).await?;
    Ok(clean_sub_queries(raw, max))
}

fn clean_sub_queries(raw: Vec<String>, max: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(max);
    for q in raw {
        let q = q.trim();
        if q.is_empty() || out.iter().any(|seen| seen.eq_ignore_ascii_case(q)) {
            continue;
        }
        out.push(q.to_string());
        if out.len() == max {
            break;
        }
    }
    out
}
