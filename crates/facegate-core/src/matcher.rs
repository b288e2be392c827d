use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::embedding::{Embedding, EnrolledIdentity};
use crate::vector;

/// Best and runner-up candidates for one probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub identity_id: String,
    pub similarity: f32,
    /// Second-best distinct identity, if the candidate set had one.
    pub second_best_id: Option<String>,
    /// 0.0 when there is no second candidate.
    pub second_best_similarity: f32,
}

/// Similarity of the probe to one identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Scored {
    pub identity_id: String,
    pub similarity: f32,
}

/// Best similarity per identity, in candidate order of first appearance.
fn aggregate(probe: &Embedding, candidates: &[EnrolledIdentity]) -> Vec<Scored> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(candidates.len());
    let mut scored: Vec<Scored> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let sim = vector::clamped_similarity(probe.values(), candidate.embedding.values());
        match index.get(candidate.identity_id.as_str()) {
            Some(&i) => scored[i].similarity = scored[i].similarity.max(sim),
            None => {
                index.insert(candidate.identity_id.as_str(), scored.len());
                scored.push(Scored {
                    identity_id: candidate.identity_id.clone(),
                    similarity: sim,
                });
            }
        }
    }
    scored
}

/// Ranking order: descending similarity, then ascending identity id, so ties
/// resolve the same way regardless of store iteration order.
fn rank(a: &Scored, b: &Scored) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.identity_id.cmp(&b.identity_id))
}

/// Score every candidate identity, sorted best first.
pub fn score_all(probe: &Embedding, candidates: &[EnrolledIdentity]) -> Vec<Scored> {
    let mut scored = aggregate(probe, candidates);
    scored.sort_by(rank);
    scored
}

/// Linear scan for the best and second-best distinct identity.
///
/// Returns `None` for an empty candidate set.
pub fn find_best(probe: &Embedding, candidates: &[EnrolledIdentity]) -> Option<MatchResult> {
    let mut best: Option<Scored> = None;
    let mut second: Option<Scored> = None;

    for scored in aggregate(probe, candidates) {
        let beats = |other: &Option<Scored>| {
            other
                .as_ref()
                .map_or(true, |o| rank(&scored, o) == Ordering::Less)
        };
        if beats(&best) {
            second = best.replace(scored);
        } else if beats(&second) {
            second = Some(scored);
        }
    }

    let best = best?;
    Some(MatchResult {
        identity_id: best.identity_id,
        similarity: best.similarity,
        second_best_similarity: second.as_ref().map_or(0.0, |s| s.similarity),
        second_best_id: second.map(|s| s.identity_id),
    })
}
