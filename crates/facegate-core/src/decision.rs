use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::liveness::LivenessRejection;
use crate::quality::QualityRejection;
use crate::security::SecurityVerdict;

/// Authentication outcome exposed to callers.
///
/// Security-gate failures are folded into `RejectedNoMatch`; which gate
/// failed is recorded only in the [`AuditRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Accepted { identity_id: String },
    RejectedLivenessFailed,
    RejectedLockout {
        #[serde(rename = "remaining_secs", with = "duration_secs")]
        remaining: Duration,
    },
    RejectedNoMatch,
    RejectedLowQualityEmbedding,
}

impl Decision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Decision::Accepted { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Accepted { .. } => "accepted",
            Decision::RejectedLivenessFailed => "rejected_liveness_failed",
            Decision::RejectedLockout { .. } => "rejected_lockout",
            Decision::RejectedNoMatch => "rejected_no_match",
            Decision::RejectedLowQualityEmbedding => "rejected_low_quality_embedding",
        }
    }
}

/// Internal reason behind a decision. Never returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum AuditReason {
    Matched,
    LockoutActive { remaining_secs: u64 },
    Liveness { rejection: LivenessRejection },
    LowQuality { rejection: QualityRejection },
    /// Embedding producer could not derive a signature from the capture.
    ProducerFailed { message: String },
    NoCandidates,
    SecurityGate { verdict: SecurityVerdict },
}

impl std::fmt::Display for AuditReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditReason::Matched => f.write_str("matched"),
            AuditReason::LockoutActive { remaining_secs } => {
                write!(f, "lockout active, {remaining_secs}s remaining")
            }
            AuditReason::Liveness { rejection } => write!(f, "liveness: {rejection}"),
            AuditReason::LowQuality { rejection } => write!(f, "low quality: {rejection}"),
            AuditReason::ProducerFailed { message } => write!(f, "producer failed: {message}"),
            AuditReason::NoCandidates => f.write_str("no enrolled candidates"),
            AuditReason::SecurityGate { verdict } => match verdict.failure() {
                Some(report) => write!(f, "security gate {report}"),
                None => f.write_str("security gate failed"),
            },
        }
    }
}

/// Full record of one completed authentication attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub attempt_id: Uuid,
    pub context: String,
    pub at: DateTime<Utc>,
    pub decision: Decision,
    pub reason: AuditReason,
    /// Identity the probe matched best, accepted or not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_identity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_similarity: Option<f32>,
    /// SHA-256 of the probe embedding; raw biometrics never enter the log.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe_digest: Option<String>,
}

impl AuditRecord {
    pub fn new(context: &str, decision: Decision, reason: AuditReason) -> Self {
        Self {
            attempt_id: Uuid::new_v4(),
            context: context.to_string(),
            at: Utc::now(),
            decision,
            reason,
            best_identity: None,
            best_similarity: None,
            probe_digest: None,
        }
    }
}

/// Decision plus its audit record.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub decision: Decision,
    pub audit: AuditRecord,
}

/// Whole seconds left in `d`, rounded up so a lockout with any time left
/// never reports zero.
pub fn remaining_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(super::remaining_secs(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
