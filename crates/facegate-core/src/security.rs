//! Security validation pipeline.
//!
//! The best match from the candidate scan has to clear five independent gates
//! before an attempt is accepted. Evaluation stops at the first failure. The
//! per-gate reports are for internal audit only; callers of the orchestrator
//! see a generic no-match.

use serde::{Deserialize, Serialize};

use crate::config::SecurityThresholds;
use crate::embedding::{Embedding, EnrolledIdentity};
use crate::matcher::{self, MatchResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    /// Best similarity at or above the similarity threshold.
    AbsoluteThreshold,
    /// Best minus second-best at or above the uniqueness gap.
    UniquenessGap,
    /// Second-best at or below its ceiling.
    SecondBestCeiling,
    /// No other enrolled identity above the cross-reference threshold.
    CrossReference,
    /// Match leads every other enrolled identity by the security gap.
    SecurityGap,
}

impl Gate {
    pub fn name(self) -> &'static str {
        match self {
            Gate::AbsoluteThreshold => "absolute_threshold",
            Gate::UniquenessGap => "uniqueness_gap",
            Gate::SecondBestCeiling => "second_best_ceiling",
            Gate::CrossReference => "cross_reference",
            Gate::SecurityGap => "security_gap",
        }
    }
}

/// Outcome of a single gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReport {
    pub gate: Gate,
    pub passed: bool,
    /// Value the gate measured.
    pub observed: f32,
    /// Bound the gate compared against.
    pub required: f32,
    /// Identity responsible for a cross-identity failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offending_identity: Option<String>,
}

impl std::fmt::Display for GateReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verdict = if self.passed { "pass" } else { "fail" };
        write!(
            f,
            "{}: {verdict} (observed {:.4}, required {:.4})",
            self.gate.name(),
            self.observed,
            self.required
        )?;
        if let Some(id) = &self.offending_identity {
            write!(f, " against {id}")?;
        }
        Ok(())
    }
}

/// Reports for every gate evaluated, in order, ending at the first failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SecurityVerdict {
    pub reports: Vec<GateReport>,
}

impl SecurityVerdict {
    pub fn passed(&self) -> bool {
        !self.reports.is_empty() && self.reports.iter().all(|r| r.passed)
    }

    pub fn failure(&self) -> Option<&GateReport> {
        self.reports.iter().find(|r| !r.passed)
    }

    fn push(&mut self, report: GateReport) -> bool {
        let passed = report.passed;
        self.reports.push(report);
        passed
    }
}

fn report(gate: Gate, passed: bool, observed: f32, required: f32) -> GateReport {
    GateReport {
        gate,
        passed,
        observed,
        required,
        offending_identity: None,
    }
}

/// Run every gate against `best`.
///
/// `all_identities` is the full enrolled population, which may be larger
/// than the candidate set `best` was drawn from (1:1 verification).
pub fn validate(
    probe: &Embedding,
    best: &MatchResult,
    all_identities: &[EnrolledIdentity],
    thresholds: &SecurityThresholds,
) -> SecurityVerdict {
    let mut verdict = SecurityVerdict::default();

    if !verdict.push(check_absolute_threshold(best, thresholds)) {
        return verdict;
    }
    if !verdict.push(check_uniqueness_gap(best, thresholds)) {
        return verdict;
    }
    if !verdict.push(check_second_best_ceiling(best, thresholds)) {
        return verdict;
    }

    let others: Vec<matcher::Scored> = matcher::score_all(probe, all_identities)
        .into_iter()
        .filter(|s| s.identity_id != best.identity_id)
        .collect();

    if !verdict.push(check_cross_reference(&others, thresholds)) {
        return verdict;
    }
    verdict.push(check_security_gap(best, &others, thresholds));
    verdict
}

pub fn check_absolute_threshold(best: &MatchResult, t: &SecurityThresholds) -> GateReport {
    report(
        Gate::AbsoluteThreshold,
        best.similarity >= t.similarity_threshold,
        best.similarity,
        t.similarity_threshold,
    )
}

pub fn check_uniqueness_gap(best: &MatchResult, t: &SecurityThresholds) -> GateReport {
    let gap = best.similarity - best.second_best_similarity;
    report(
        Gate::UniquenessGap,
        gap >= t.minimum_uniqueness_gap,
        gap,
        t.minimum_uniqueness_gap,
    )
}

pub fn check_second_best_ceiling(best: &MatchResult, t: &SecurityThresholds) -> GateReport {
    report(
        Gate::SecondBestCeiling,
        best.second_best_similarity <= t.maximum_second_best_similarity,
        best.second_best_similarity,
        t.maximum_second_best_similarity,
    )
}

/// `others` must exclude the matched identity and be sorted best first.
pub fn check_cross_reference(others: &[matcher::Scored], t: &SecurityThresholds) -> GateReport {
    match others.first() {
        Some(top) if top.similarity > t.cross_reference_threshold => GateReport {
            gate: Gate::CrossReference,
            passed: false,
            observed: top.similarity,
            required: t.cross_reference_threshold,
            offending_identity: Some(top.identity_id.clone()),
        },
        top => report(
            Gate::CrossReference,
            true,
            top.map_or(0.0, |s| s.similarity),
            t.cross_reference_threshold,
        ),
    }
}

/// `others` must exclude the matched identity and be sorted best first.
pub fn check_security_gap(
    best: &MatchResult,
    others: &[matcher::Scored],
    t: &SecurityThresholds,
) -> GateReport {
    let runner_up = others.first();
    let gap = best.similarity - runner_up.map_or(0.0, |s| s.similarity);
    GateReport {
        gate: Gate::SecurityGap,
        passed: gap >= t.required_security_gap,
        observed: gap,
        required: t.required_security_gap,
        offending_identity: runner_up
            .filter(|_| gap < t.required_security_gap)
            .map(|s| s.identity_id.clone()),
    }
}
