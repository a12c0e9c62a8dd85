//! Reciprocal Rank Fusion.
//!
//! For a passage at 1-based rank `r_s` in strategy `s`, the fused score is
//! `Σ_s 1/(k + r_s)` over the strategies that returned it. Ranking is by
//! score descending, then contributing-strategy count descending, then best
//! raw similarity descending, then id ascending. The id tie-break makes the
//! order total, and summing per strategy in canonical strategy order keeps
//! the float score independent of input order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use ciq_core::passage::{FusedResult, PassageCandidate, StrategyName};

/// One strategy's ranked output (best first).
#[derive(Debug, Clone, PartialEq)]
pub struct RankedList {
    pub strategy: StrategyName,
    pub candidates: Vec<PassageCandidate>,
}

impl RankedList {
    pub fn new(strategy: StrategyName, candidates: Vec<PassageCandidate>) -> Self {
        Self { strategy, candidates }
    }
}

/// Accumulated state for one passage id.
struct Entry {
    /// Best (lowest) rank per strategy.
    ranks: BTreeMap<StrategyName, usize>,
    best: PassageCandidate,
}

fn better_representative(candidate: &PassageCandidate, current: &PassageCandidate) -> bool {
    match candidate.similarity.total_cmp(&current.similarity) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => candidate.origin_strategy < current.origin_strategy,
    }
}

/// Fuse per-strategy lists into at most `limit` ranked results.
pub fn reciprocal_rank_fusion(lists: &[RankedList], k: u32, limit: usize) -> Vec<FusedResult> {
    let mut entries: HashMap<&str, Entry> = HashMap::new();

    for list in lists {
        for (position, candidate) in list.candidates.iter().enumerate() {
            let rank = position + 1;
            match entries.get_mut(candidate.id.as_str()) {
                Some(entry) => {
                    let slot = entry.ranks.entry(list.strategy).or_insert(rank);
                    *slot = (*slot).min(rank);
                    if better_representative(candidate, &entry.best) {
                        entry.best = candidate.clone();
                    }
                }
                None => {
                    entries.insert(
                        candidate.id.as_str(),
                        Entry {
                            ranks: BTreeMap::from([(list.strategy, rank)]),
                            best: candidate.clone(),
                        },
                    );
                }
            }
        }
    }

    let k = f64::from(k);
    let mut fused: Vec<FusedResult> = entries
        .into_values()
        .map(|entry| {
            let fused_score = entry
                .ranks
                .values()
                .map(|&rank| 1.0 / (k + rank as f64))
                .sum::<f64>();
            FusedResult {
                id: entry.best.id,
                text: entry.best.text,
                source_metadata: entry.best.source_metadata,
                fused_rank: 0,
                fused_score,
                best_similarity: entry.best.similarity,
                contributing_strategies: entry.ranks.keys().copied().collect::<BTreeSet<_>>(),
            }
        })
        .collect();

    fused.sort_by(compare_fused);
    fused.truncate(limit);
    for (i, result) in fused.iter_mut().enumerate() {
        result.fused_rank = i + 1;
    }
    fused
}

/// The fused ranking's tie-break chain.
pub fn compare_fused(a: &FusedResult, b: &FusedResult) -> Ordering {
    b.fused_score
        .total_cmp(&a.fused_score)
        .then_with(|| b.contributing_strategies.len().cmp(&a.contributing_strategies.len()))
        .then_with(|| b.best_similarity.total_cmp(&a.best_similarity))
        .then_with(|| a.id.cmp(&b.id))
}

/// Merge several result lists of one strategy into a single ranked list.
///
/// Each passage keeps its best rank across the lists; equal ranks are
/// ordered by similarity descending, then id ascending.
pub fn merge_ranked_lists(lists: Vec<Vec<PassageCandidate>>) -> Vec<PassageCandidate> {
    let mut best: HashMap<String, (usize, PassageCandidate)> = HashMap::new();
    for list in lists {
        for (position, candidate) in list.into_iter().enumerate() {
            let rank = position + 1;
            match best.get_mut(&candidate.id) {
                Some((r, existing)) => {
                    if rank < *r || (rank == *r && candidate.similarity > existing.similarity) {
                        *r = rank;
                        *existing = candidate;
                    }
                }
                None => {
                    best.insert(candidate.id.clone(), (rank, candidate));
                }
            }
        }
    }

    let mut merged: Vec<(usize, PassageCandidate)> = best.into_values().collect();
    merged.sort_by(|(ra, a), (rb, b)| {
        ra.cmp(rb)
            .then_with(|| b.similarity.total_cmp(&a.similarity))
            .then_with(|| a.id.cmp(&b.id))
    });
    merged.into_iter().map(|(_, c)| c).collect()
}
