//! Enroll and authenticate workflows.
//!
//! [`Authenticator`] is a pure, synchronous sequencer over snapshots of the
//! enrolled population. It owns no mutable state: the caller passes the
//! context's [`LockoutState`] by `&mut`, which is written exactly once at the
//! end of a completed attempt.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{AuthConfig, ConfigError};
use crate::decision::{remaining_secs, AuditReason, AuditRecord, AuthOutcome, Decision};
use crate::embedding::{Embedding, EnrolledIdentity};
use crate::liveness::{self, FrameSignals, Landmarks};
use crate::lockout::{LockoutPolicy, LockoutState, LockoutStatus};
use crate::matcher;
use crate::quality::{self, QualityRejection};
use crate::security;

/// Everything the capture pipeline hands over for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAttempt {
    pub probe: Embedding,
    pub signals: FrameSignals,
    /// Landmarks from consecutive frames, oldest first. May be empty.
    #[serde(default)]
    pub landmarks: Vec<Landmarks>,
}

impl AuthAttempt {
    pub fn new(probe: Embedding, signals: FrameSignals) -> Self {
        Self {
            probe,
            signals,
            landmarks: Vec::new(),
        }
    }

    pub fn with_landmarks(mut self, landmarks: Vec<Landmarks>) -> Self {
        self.landmarks = landmarks;
        self
    }
}

/// An embedding cleared for persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct Enrolled {
    pub identity_id: String,
    /// Normalized form of the submitted embedding.
    pub embedding: Embedding,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnrollRejection {
    #[error("low quality embedding: {0}")]
    LowQuality(QualityRejection),
    #[error("embedding duplicates an enrolled identity (similarity {similarity:.4})")]
    Duplicate {
        similarity: f32,
        /// Kept for audit; not meant to be shown to the enrolling user.
        conflicting_identity: String,
    },
}

pub struct Authenticator {
    config: AuthConfig,
    policy: LockoutPolicy,
}

impl Authenticator {
    pub fn new(config: AuthConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let policy = LockoutPolicy {
            max_failed_attempts: config.max_failed_attempts,
            lockout_duration: config.lockout_duration(),
        };
        Ok(Self { config, policy })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn lockout_policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Quality gate, then uniqueness gate against every other identity.
    ///
    /// Records belonging to `identity_id` itself are ignored, since
    /// re-enrollment replaces them wholesale.
    pub fn enroll(
        &self,
        identity_id: &str,
        candidate: &Embedding,
        existing: &[EnrolledIdentity],
    ) -> Result<Enrolled, EnrollRejection> {
        let normalized = quality::check(candidate, self.config.embedding_length)
            .map_err(EnrollRejection::LowQuality)?;

        let others: Vec<EnrolledIdentity> = existing
            .iter()
            .filter(|e| e.identity_id != identity_id)
            .cloned()
            .collect();

        if let Some(closest) = matcher::score_all(&normalized, &others).into_iter().next() {
            if closest.similarity >= self.config.duplicate_enrollment_threshold {
                tracing::warn!(
                    identity = identity_id,
                    conflicting = %closest.identity_id,
                    similarity = closest.similarity,
                    "enroll: embedding duplicates an existing identity"
                );
                return Err(EnrollRejection::Duplicate {
                    similarity: closest.similarity,
                    conflicting_identity: closest.identity_id,
                });
            }
        }

        Ok(Enrolled {
            identity_id: identity_id.to_string(),
            embedding: normalized,
        })
    }

    /// 1:N authentication against `candidates`, which is also the population
    /// used by the cross-identity gates.
    pub fn authenticate(
        &self,
        context: &str,
        attempt: &AuthAttempt,
        candidates: &[EnrolledIdentity],
        lockout: &mut LockoutState,
        now: Instant,
    ) -> AuthOutcome {
        self.evaluate(context, attempt, candidates, candidates, lockout, now)
    }

    /// Lockout, liveness, quality, matching over `candidates`, security gates
    /// over `population`, then one lockout update.
    pub fn evaluate(
        &self,
        context: &str,
        attempt: &AuthAttempt,
        candidates: &[EnrolledIdentity],
        population: &[EnrolledIdentity],
        lockout: &mut LockoutState,
        now: Instant,
    ) -> AuthOutcome {
        if let Some(outcome) = self.lockout_outcome(context, lockout, now) {
            return outcome;
        }

        let outcome = match self.precheck(context, attempt) {
            Ok(probe) => self.match_probe(context, &probe, candidates, population),
            Err(rejected) => rejected,
        };
        self.commit(context, Some(&attempt.probe), outcome, lockout, now)
    }

    /// Liveness gate on the frame signals alone.
    ///
    /// Needs no embedding, so hosts can run it before invoking the model.
    pub fn check_liveness(
        &self,
        context: &str,
        signals: &FrameSignals,
        landmarks: &[Landmarks],
    ) -> Result<(), AuthOutcome> {
        liveness::evaluate(signals, landmarks, &self.config.liveness).map_err(|rejection| {
            outcome_of(
                context,
                Decision::RejectedLivenessFailed,
                AuditReason::Liveness { rejection },
            )
        })
    }

    /// Liveness then quality. Returns the normalized probe, or the rejection.
    ///
    /// Touches neither the store nor the lockout state.
    pub fn precheck(&self, context: &str, attempt: &AuthAttempt) -> Result<Embedding, AuthOutcome> {
        self.check_liveness(context, &attempt.signals, &attempt.landmarks)?;

        quality::check(&attempt.probe, self.config.embedding_length).map_err(|rejection| {
            outcome_of(
                context,
                Decision::RejectedLowQualityEmbedding,
                AuditReason::LowQuality { rejection },
            )
        })
    }

    /// Match a prechecked probe over `candidates` and run the security gates
    /// over `population`.
    pub fn match_probe(
        &self,
        context: &str,
        probe: &Embedding,
        candidates: &[EnrolledIdentity],
        population: &[EnrolledIdentity],
    ) -> AuthOutcome {
        let Some(best) = matcher::find_best(probe, candidates) else {
            return outcome_of(context, Decision::RejectedNoMatch, AuditReason::NoCandidates);
        };

        let verdict = security::validate(probe, &best, population, &self.config.thresholds);
        for report in &verdict.reports {
            tracing::debug!(context, gate = report.gate.name(), %report, "security gate");
        }

        let mut outcome = if verdict.passed() {
            outcome_of(
                context,
                Decision::Accepted {
                    identity_id: best.identity_id.clone(),
                },
                AuditReason::Matched,
            )
        } else {
            outcome_of(
                context,
                Decision::RejectedNoMatch,
                AuditReason::SecurityGate { verdict },
            )
        };
        outcome.audit.best_identity = Some(best.identity_id);
        outcome.audit.best_similarity = Some(best.similarity);
        outcome
    }

    /// Final step of a completed attempt: stamp the probe digest, apply the
    /// one lockout update the decision calls for, and log it.
    pub fn commit(
        &self,
        context: &str,
        probe: Option<&Embedding>,
        mut outcome: AuthOutcome,
        lockout: &mut LockoutState,
        now: Instant,
    ) -> AuthOutcome {
        outcome.audit.probe_digest = probe.map(Embedding::digest_hex);

        match &outcome.decision {
            Decision::Accepted { .. } => lockout.clear_on_success(),
            Decision::RejectedNoMatch => {
                lockout.record_failure(now, &self.policy);
            }
            _ => {}
        }

        tracing::info!(
            context,
            decision = outcome.decision.kind(),
            reason = %outcome.audit.reason,
            best_identity = ?outcome.audit.best_identity,
            best_similarity = ?outcome.audit.best_similarity,
            failed_attempts = lockout.failed_attempts(),
            "authenticate complete"
        );
        outcome
    }

    /// The rejection for a context that is currently locked out, if it is.
    pub fn lockout_outcome(
        &self,
        context: &str,
        lockout: &mut LockoutState,
        now: Instant,
    ) -> Option<AuthOutcome> {
        let LockoutStatus::LockedOut { remaining } = lockout.status(now, &self.policy) else {
            return None;
        };
        tracing::warn!(
            context,
            remaining_secs = remaining_secs(remaining),
            "authenticate: lockout active"
        );
        Some(outcome_of(
            context,
            Decision::RejectedLockout { remaining },
            AuditReason::LockoutActive {
                remaining_secs: remaining_secs(remaining),
            },
        ))
    }
}

/// Outcome whose audit record mirrors `decision`.
fn outcome_of(context: &str, decision: Decision, reason: AuditReason) -> AuthOutcome {
    AuthOutcome {
        audit: AuditRecord::new(context, decision.clone(), reason),
        decision,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::SecurityThresholds;
    use crate::decision::AuditReason;
    use crate::liveness::HeadPose;
    use crate::security::Gate;
    use crate::test_support::{scene, spread};

    fn authenticator() -> Authenticator {
        Authenticator::new(AuthConfig::default()).unwrap()
    }

    fn attempt(probe: Embedding) -> AuthAttempt {
        AuthAttempt::new(probe, FrameSignals::frontal())
    }

    #[test]
    fn test_rejects_invalid_config() {
        let cfg = AuthConfig {
            embedding_length: 0,
            ..AuthConfig::default()
        };
        assert!(Authenticator::new(cfg).is_err());
    }

    #[test]
    fn test_enroll_accepts_and_normalizes() {
        let raw = spread(512, 42);
        let enrolled = authenticator().enroll("alice", &raw, &[]).unwrap();
        assert_eq!(enrolled.identity_id, "alice");
        assert!((enrolled.embedding.norm() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_enroll_rejects_constant_embedding() {
        let raw = Embedding::new(vec![0.1; 512]);
        assert!(matches!(
            authenticator().enroll("alice", &raw, &[]),
            Err(EnrollRejection::LowQuality(_))
        ));
    }

    #[test]
    fn test_enroll_rejects_duplicate_of_other_identity() {
        let raw = spread(512, 9);
        let existing = vec![EnrolledIdentity::new("bob", raw.normalized())];
        let err = authenticator().enroll("alice", &raw, &existing).unwrap_err();
        match err {
            EnrollRejection::Duplicate {
                similarity,
                conflicting_identity,
            } => {
                assert!(similarity > 0.99);
                assert_eq!(conflicting_identity, "bob");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reenroll_same_identity_allowed() {
        let raw = spread(512, 9);
        let existing = vec![EnrolledIdentity::new("alice", raw.normalized())];
        assert!(authenticator().enroll("alice", &raw, &existing).is_ok());
    }

    #[test]
    fn test_similar_but_distinct_faces_enroll() {
        let s = scene(512, &[0.95]);
        let existing = vec![EnrolledIdentity::new("bob", s.probe.clone())];
        assert!(authenticator()
            .enroll("alice", &s.identities[0].embedding, &existing)
            .is_ok());
    }

    #[test]
    fn test_enroll_then_authenticate_round_trip() {
        let auth = authenticator();
        let raw = spread(512, 77);
        let others = scene(512, &[0.2, 0.1]);

        let mut store: Vec<EnrolledIdentity> = others.identities.clone();
        let enrolled = auth.enroll("alice", &raw, &store).unwrap();
        store.push(EnrolledIdentity::new(enrolled.identity_id, enrolled.embedding));

        let mut lockout = LockoutState::new();
        let outcome = auth.authenticate("phone", &attempt(raw), &store, &mut lockout, Instant::now());
        assert_eq!(
            outcome.decision,
            Decision::Accepted {
                identity_id: "alice".into()
            }
        );
        assert_eq!(outcome.audit.reason, AuditReason::Matched);
        assert!(outcome.audit.probe_digest.is_some());
    }

    #[test]
    fn test_near_duplicate_probe_accepted() {
        let s = scene(512, &[0.93, 0.25, 0.05]);
        let mut lockout = LockoutState::new();
        let outcome = authenticator().authenticate(
            "phone",
            &attempt(s.probe.clone()),
            &s.identities,
            &mut lockout,
            Instant::now(),
        );
        assert_eq!(
            outcome.decision,
            Decision::Accepted {
                identity_id: "id-0".into()
            }
        );
    }

    #[test]
    fn test_gate_failure_is_generic_no_match() {
        let s = scene(512, &[0.90, 0.89]);
        let mut lockout = LockoutState::new();
        let outcome = authenticator().authenticate(
            "phone",
            &attempt(s.probe.clone()),
            &s.identities,
            &mut lockout,
            Instant::now(),
        );
        assert_eq!(outcome.decision, Decision::RejectedNoMatch);
        match &outcome.audit.reason {
            AuditReason::SecurityGate { verdict } => {
                assert_eq!(verdict.failure().unwrap().gate, Gate::UniquenessGap);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(lockout.failed_attempts(), 1);
    }

    #[test]
    fn test_cross_reference_rejects_in_verification() {
        let cfg = AuthConfig {
            thresholds: SecurityThresholds {
                similarity_threshold: 0.75,
                minimum_uniqueness_gap: 0.0,
                maximum_second_best_similarity: 0.5,
                cross_reference_threshold: 0.70,
                required_security_gap: 0.0,
            },
            ..AuthConfig::default()
        };
        let auth = Authenticator::new(cfg).unwrap();
        let s = scene(512, &[0.80, 0.75]);
        let mut lockout = LockoutState::new();
        let outcome = auth.evaluate(
            "phone",
            &attempt(s.probe.clone()),
            &s.identities[..1],
            &s.identities,
            &mut lockout,
            Instant::now(),
        );
        assert_eq!(outcome.decision, Decision::RejectedNoMatch);
        match &outcome.audit.reason {
            AuditReason::SecurityGate { verdict } => {
                assert_eq!(verdict.failure().unwrap().gate, Gate::CrossReference);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_population_is_no_match() {
        let mut lockout = LockoutState::new();
        let outcome = authenticator().authenticate(
            "phone",
            &attempt(spread(512, 5)),
            &[],
            &mut lockout,
            Instant::now(),
        );
        assert_eq!(outcome.decision, Decision::RejectedNoMatch);
        assert_eq!(outcome.audit.reason, AuditReason::NoCandidates);
    }

    #[test]
    fn test_liveness_failure_does_not_count() {
        let s = scene(512, &[0.93]);
        let closed = FrameSignals {
            left_eye_open: 0.0,
            right_eye_open: 0.0,
            head_pose: HeadPose::default(),
        };
        let mut lockout = LockoutState::new();
        let outcome = authenticator().authenticate(
            "phone",
            &AuthAttempt::new(s.probe.clone(), closed),
            &s.identities,
            &mut lockout,
            Instant::now(),
        );
        assert_eq!(outcome.decision, Decision::RejectedLivenessFailed);
        assert_eq!(lockout.failed_attempts(), 0);
    }

    #[test]
    fn test_low_quality_probe_rejected() {
        let s = scene(512, &[0.93]);
        let mut lockout = LockoutState::new();
        let outcome = authenticator().authenticate(
            "phone",
            &attempt(Embedding::new(vec![0.5; 512])),
            &s.identities,
            &mut lockout,
            Instant::now(),
        );
        assert_eq!(outcome.decision, Decision::RejectedLowQualityEmbedding);
        assert_eq!(lockout.failed_attempts(), 0);
    }

    #[test]
    fn test_lockout_then_expiry() {
        let auth = authenticator();
        let s = scene(512, &[0.93, 0.2]);
        let impostor = spread(512, 999);
        let start = Instant::now();
        let mut lockout = LockoutState::new();

        for _ in 0..auth.config().max_failed_attempts {
            let outcome = auth.authenticate(
                "phone",
                &attempt(impostor.clone()),
                &s.identities,
                &mut lockout,
                start,
            );
            assert_eq!(outcome.decision, Decision::RejectedNoMatch);
        }

        // Even the genuine user is turned away while locked.
        let outcome = auth.authenticate(
            "phone",
            &attempt(s.probe.clone()),
            &s.identities,
            &mut lockout,
            start + Duration::from_secs(10),
        );
        assert_eq!(
            outcome.decision,
            Decision::RejectedLockout {
                remaining: Duration::from_secs(290)
            }
        );
        assert!(outcome.audit.best_identity.is_none());

        let outcome = auth.authenticate(
            "phone",
            &attempt(s.probe.clone()),
            &s.identities,
            &mut lockout,
            start + auth.config().lockout_duration(),
        );
        assert!(outcome.decision.is_accepted());
    }

    #[test]
    fn test_success_resets_failures() {
        let auth = authenticator();
        let s = scene(512, &[0.93, 0.2]);
        let impostor = spread(512, 999);
        let now = Instant::now();
        let mut lockout = LockoutState::new();

        for _ in 0..3 {
            auth.authenticate("phone", &attempt(impostor.clone()), &s.identities, &mut lockout, now);
        }
        assert_eq!(lockout.failed_attempts(), 3);

        let outcome =
            auth.authenticate("phone", &attempt(s.probe.clone()), &s.identities, &mut lockout, now);
        assert!(outcome.decision.is_accepted());
        assert_eq!(lockout.failed_attempts(), 0);
    }
}
