//! Cheap liveness pre-filters run before any matching.
//!
//! Two signals are checked:
//!
//! - **Frame signals**: eye-open probabilities and head pose from the face
//!   detector. Both eyes must be at least minimally open and every head angle
//!   must lie within the configured bound.
//! - **Landmark stability**: a static photograph produces near-identical eye
//!   landmark positions across consecutive frames, while a live person shows
//!   involuntary micro-saccades and drift. Optional, needs two or more frames.
//!
//! The gate is deliberately lenient. It turns away closed eyes, extreme poses
//! and printed photos; it does not stop video replay, 3D masks or adversarial
//! displays and is no substitute for full anti-spoofing.

use serde::{Deserialize, Serialize};

use crate::config::LivenessConfig;

/// Eye-openness strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessProfile {
    Lenient,
    #[default]
    Standard,
    Strict,
}

impl LivenessProfile {
    /// Eye-open probability each eye must exceed.
    pub fn min_eye_open(self) -> f32 {
        match self {
            LivenessProfile::Lenient => 0.1,
            LivenessProfile::Standard => 0.2,
            LivenessProfile::Strict => 0.3,
        }
    }
}

/// Head orientation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadPose {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

/// Per-frame detector output consumed by the liveness gate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameSignals {
    /// Left eye-open probability in [0, 1].
    pub left_eye_open: f32,
    /// Right eye-open probability in [0, 1].
    pub right_eye_open: f32,
    pub head_pose: HeadPose,
}

impl FrameSignals {
    /// Eyes wide open, facing the camera.
    pub fn frontal() -> Self {
        Self {
            left_eye_open: 1.0,
            right_eye_open: 1.0,
            head_pose: HeadPose::default(),
        }
    }
}

/// Five-point facial landmarks; indices 0 and 1 are the left and right eye
/// centres.
pub type Landmarks = [(f32, f32); 5];

/// Why the liveness gate turned a frame away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessRejection {
    EyesClosed,
    ExtremeHeadPose,
    StaticImage,
}

impl std::fmt::Display for LivenessRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LivenessRejection::EyesClosed => "eyes closed",
            LivenessRejection::ExtremeHeadPose => "extreme head pose",
            LivenessRejection::StaticImage => "static image",
        };
        f.write_str(s)
    }
}

/// Check eye openness and head pose for a single frame.
///
/// Comparisons are written so that NaN signals fail: a NaN eye probability
/// reads as closed and a NaN angle as out of bounds.
pub fn check_frame(
    signals: &FrameSignals,
    profile: LivenessProfile,
    max_head_angle_degrees: f32,
) -> Result<(), LivenessRejection> {
    let min_open = profile.min_eye_open();
    if !(signals.left_eye_open > min_open && signals.right_eye_open > min_open) {
        return Err(LivenessRejection::EyesClosed);
    }

    let pose = &signals.head_pose;
    let within = |angle: f32| angle.abs() <= max_head_angle_degrees;
    if !(within(pose.pitch) && within(pose.yaw) && within(pose.roll)) {
        return Err(LivenessRejection::ExtremeHeadPose);
    }

    Ok(())
}

/// Result of a landmark stability liveness check.
#[derive(Debug, Clone)]
pub struct LandmarkStability {
    /// Whether the frames passed the check (true = likely live).
    pub is_live: bool,
    /// Mean Euclidean displacement of eye landmarks across consecutive frame pairs.
    pub mean_eye_displacement: f32,
    /// Number of frame pairs analysed.
    pub frame_pairs_analysed: usize,
}

/// Check whether a landmark sequence shows enough eye movement to indicate a
/// live subject.
///
/// Fewer than two frames pass through (`is_live = true`), since at least one
/// frame pair is needed to measure anything.
pub fn check_landmark_stability(
    landmark_sequence: &[Landmarks],
    min_displacement: f32,
) -> LandmarkStability {
    if landmark_sequence.len() < 2 {
        return LandmarkStability {
            is_live: true,
            mean_eye_displacement: 0.0,
            frame_pairs_analysed: 0,
        };
    }

    let eye_shift = |prev: (f32, f32), curr: (f32, f32)| {
        let dx = curr.0 - prev.0;
        let dy = curr.1 - prev.1;
        (dx * dx + dy * dy).sqrt()
    };

    let pairs = landmark_sequence.len() - 1;
    let total: f32 = landmark_sequence
        .windows(2)
        .map(|pair| {
            let left = eye_shift(pair[0][0], pair[1][0]);
            let right = eye_shift(pair[0][1], pair[1][1]);
            (left + right) / 2.0
        })
        .sum();
    let mean = total / pairs as f32;

    LandmarkStability {
        is_live: mean >= min_displacement,
        mean_eye_displacement: mean,
        frame_pairs_analysed: pairs,
    }
}

/// Run every configured liveness check over one attempt's detector output.
pub fn evaluate(
    signals: &FrameSignals,
    landmarks: &[Landmarks],
    config: &LivenessConfig,
) -> Result<(), LivenessRejection> {
    check_frame(signals, config.profile, config.max_head_angle_degrees)?;

    if let Some(min_displacement) = config.min_landmark_displacement {
        let stability = check_landmark_stability(landmarks, min_displacement);
        if !stability.is_live {
            tracing::debug!(
                mean_eye_displacement = stability.mean_eye_displacement,
                frame_pairs = stability.frame_pairs_analysed,
                min_displacement,
                "liveness: landmarks static across frames"
            );
            return Err(LivenessRejection::StaticImage);
        }
    }

    Ok(())
}
