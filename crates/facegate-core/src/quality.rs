//! Embedding quality gate.
//!
//! A near-constant embedding cannot discriminate between faces and scores
//! spuriously high against everything, so it is turned away before any
//! similarity comparison, at both enrollment and authentication.

use serde::{Deserialize, Serialize};

use crate::embedding::Embedding;
use crate::vector;

pub const MIN_VARIANCE: f32 = 0.0005;
pub const MIN_RANGE: f32 = 0.075;
pub const MIN_STD_DEV: f32 = 0.025;

/// Spread statistics of a normalized embedding.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityStats {
    pub variance: f32,
    pub range: f32,
    pub std_dev: f32,
}

impl QualityStats {
    pub fn of(values: &[f32]) -> Self {
        Self {
            variance: vector::variance(values),
            range: vector::range(values),
            std_dev: vector::std_dev(values),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QualityRejection {
    WrongDimension { expected: usize, actual: usize },
    NonFinite,
    ZeroVector,
    LowVariance { variance: f32 },
    LowRange { range: f32 },
    LowStdDev { std_dev: f32 },
}

impl std::fmt::Display for QualityRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QualityRejection::WrongDimension { expected, actual } => {
                write!(f, "embedding has {actual} components, expected {expected}")
            }
            QualityRejection::NonFinite => f.write_str("embedding contains NaN or infinity"),
            QualityRejection::ZeroVector => f.write_str("embedding has zero norm"),
            QualityRejection::LowVariance { variance } => {
                write!(f, "variance {variance:.6} below {MIN_VARIANCE}")
            }
            QualityRejection::LowRange { range } => {
                write!(f, "range {range:.4} below {MIN_RANGE}")
            }
            QualityRejection::LowStdDev { std_dev } => {
                write!(f, "standard deviation {std_dev:.4} below {MIN_STD_DEV}")
            }
        }
    }
}

/// Validate a raw embedding and return its normalized form.
///
/// Dimension and finiteness are checked on the raw vector; the spread bounds
/// apply to the normalized one so they are independent of the model's output
/// scale.
pub fn check(raw: &Embedding, expected_len: usize) -> Result<Embedding, QualityRejection> {
    if raw.len() != expected_len {
        return Err(QualityRejection::WrongDimension {
            expected: expected_len,
            actual: raw.len(),
        });
    }
    if !raw.is_finite() {
        return Err(QualityRejection::NonFinite);
    }

    let normalized = raw.normalized();
    if (normalized.norm() - 1.0).abs() > 0.1 {
        return Err(QualityRejection::ZeroVector);
    }

    let stats = QualityStats::of(normalized.values());
    if stats.variance < MIN_VARIANCE {
        return Err(QualityRejection::LowVariance {
            variance: stats.variance,
        });
    }
    if stats.range < MIN_RANGE {
        return Err(QualityRejection::LowRange { range: stats.range });
    }
    if stats.std_dev < MIN_STD_DEV {
        return Err(QualityRejection::LowStdDev {
            std_dev: stats.std_dev,
        });
    }

    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spread;

    #[test]
    fn test_accepts_spread_embedding() {
        let normalized = check(&spread(512, 7), 512).unwrap();
        assert!((normalized.norm() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_constant_embedding_rejected() {
        let raw = Embedding::new(vec![0.25; 512]);
        assert!(matches!(
            check(&raw, 512),
            Err(QualityRejection::LowVariance { .. })
        ));
    }

    #[test]
    fn test_zero_embedding_rejected() {
        let raw = Embedding::new(vec![0.0; 512]);
        assert_eq!(check(&raw, 512), Err(QualityRejection::ZeroVector));
    }

    #[test]
    fn test_huge_scale_judged_on_spread() {
        let values: Vec<f32> = spread(512, 7).values().iter().map(|x| x * 1.0e30).collect();
        let normalized = check(&Embedding::new(values), 512).unwrap();
        assert!((normalized.norm() - 1.0).abs() < 1e-4);

        let flat = Embedding::new(vec![1.0e30; 512]);
        assert!(matches!(
            check(&flat, 512),
            Err(QualityRejection::LowVariance { .. })
        ));
    }

    #[test]
    fn test_wrong_dimension_rejected() {
        assert_eq!(
            check(&spread(128, 1), 512),
            Err(QualityRejection::WrongDimension {
                expected: 512,
                actual: 128
            })
        );
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut values = spread(512, 3).values().to_vec();
        values[10] = f32::NAN;
        assert_eq!(
            check(&Embedding::new(values), 512),
            Err(QualityRejection::NonFinite)
        );
    }

    #[test]
    fn test_common_offset_rejected() {
        // A shared offset dominates the norm; after normalization every
        // component sits near 1/sqrt(512).
        let values = (0..512).map(|i| 1.0 + 0.01 * (i % 2) as f32).collect();
        assert!(matches!(
            check(&Embedding::new(values), 512),
            Err(QualityRejection::LowVariance { .. })
        ));
    }
}
