use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::liveness::LivenessProfile;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be within [0, 1], got {value}")]
    OutOfUnitRange { field: &'static str, value: f32 },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error(
        "maximum_second_best_similarity ({max_second}) must be below similarity_threshold ({threshold})"
    )]
    InconsistentCeiling { max_second: f32, threshold: f32 },
}

/// Match thresholds for one deployment. Never mutated at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityThresholds {
    /// Minimum similarity between the probe and the best match.
    pub similarity_threshold: f32,
    /// Minimum distance between the best and second-best candidate.
    pub minimum_uniqueness_gap: f32,
    /// Ceiling on the second-best candidate's similarity.
    pub maximum_second_best_similarity: f32,
    /// No identity other than the match may score above this.
    pub cross_reference_threshold: f32,
    /// Margin the match must hold over every other identity in the store.
    pub required_security_gap: f32,
}

impl Default for SecurityThresholds {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.70,
            minimum_uniqueness_gap: 0.20,
            maximum_second_best_similarity: 0.60,
            cross_reference_threshold: 0.70,
            required_security_gap: 0.15,
        }
    }
}

impl SecurityThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        unit("similarity_threshold", self.similarity_threshold)?;
        unit("minimum_uniqueness_gap", self.minimum_uniqueness_gap)?;
        unit(
            "maximum_second_best_similarity",
            self.maximum_second_best_similarity,
        )?;
        unit("cross_reference_threshold", self.cross_reference_threshold)?;
        unit("required_security_gap", self.required_security_gap)?;
        if self.maximum_second_best_similarity >= self.similarity_threshold {
            return Err(ConfigError::InconsistentCeiling {
                max_second: self.maximum_second_best_similarity,
                threshold: self.similarity_threshold,
            });
        }
        Ok(())
    }
}

/// Liveness gate settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    pub profile: LivenessProfile,
    /// Head pitch/yaw/roll bound in degrees.
    pub max_head_angle_degrees: f32,
    /// Minimum mean eye landmark displacement (pixels) across frames.
    /// `None` disables the landmark stability check.
    pub min_landmark_displacement: Option<f32>,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            profile: LivenessProfile::Standard,
            max_head_angle_degrees: 45.0,
            min_landmark_displacement: Some(0.8),
        }
    }
}

/// Complete configuration of the decision core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub thresholds: SecurityThresholds,
    /// Consecutive no-match results before a context is locked out.
    pub max_failed_attempts: u32,
    pub lockout_duration_secs: u64,
    /// Expected embedding dimension; any other length is rejected.
    pub embedding_length: usize,
    /// Enrollment is refused when the candidate scores at or above this
    /// against any other enrolled identity.
    pub duplicate_enrollment_threshold: f32,
    pub liveness: LivenessConfig,
    /// Upper bound on a single identity store call.
    pub store_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::arcface_512()
    }
}

impl AuthConfig {
    /// 512-dimensional ArcFace-style embeddings.
    pub fn arcface_512() -> Self {
        Self {
            thresholds: SecurityThresholds::default(),
            max_failed_attempts: 5,
            lockout_duration_secs: 300,
            embedding_length: 512,
            duplicate_enrollment_threshold: 0.99,
            liveness: LivenessConfig::default(),
            store_timeout_ms: 5_000,
        }
    }

    /// 128-dimensional FaceNet-style embeddings.
    ///
    /// Lower-dimensional signatures crowd together, so the absolute threshold
    /// is higher and the gaps are narrower.
    pub fn facenet_128() -> Self {
        Self {
            thresholds: SecurityThresholds {
                similarity_threshold: 0.80,
                minimum_uniqueness_gap: 0.15,
                maximum_second_best_similarity: 0.70,
                cross_reference_threshold: 0.75,
                required_security_gap: 0.10,
            },
            embedding_length: 128,
            ..Self::arcface_512()
        }
    }

    pub fn lockout_duration(&self) -> Duration {
        Duration::from_secs(self.lockout_duration_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;
        unit(
            "duplicate_enrollment_threshold",
            self.duplicate_enrollment_threshold,
        )?;
        if self.max_failed_attempts == 0 {
            return Err(ConfigError::Zero("max_failed_attempts"));
        }
        if self.lockout_duration_secs == 0 {
            return Err(ConfigError::Zero("lockout_duration_secs"));
        }
        if self.embedding_length == 0 {
            return Err(ConfigError::Zero("embedding_length"));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::Zero("store_timeout_ms"));
        }
        Ok(())
    }
}

fn unit(field: &'static str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::OutOfUnitRange { field, value });
    }
    Ok(())
}
