//! Vector math over fixed-length embeddings.
//!
//! Matching only ever uses [`normalize`] and [`cosine_similarity`]. The
//! descriptive statistics ([`variance`], [`range`], [`std_dev`]) exist for the
//! embedding quality gate and carry no weight in similarity scoring.

use thiserror::Error;

/// Norms at or below this value are treated as zero.
const ZERO_NORM_EPSILON: f32 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VectorError {
    #[error("vector has zero norm")]
    ZeroVector,
    #[error("dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

/// Euclidean (L2) norm of `v`.
///
/// Squares are summed in f64; a finite f32 vector can overflow an f32 sum.
pub fn l2_norm(v: &[f32]) -> f32 {
    norm_f64(v) as f32
}

fn norm_f64(v: &[f32]) -> f64 {
    v.iter().map(|&x| f64::from(x) * f64::from(x)).sum::<f64>().sqrt()
}

/// Return a unit-length copy of `v`.
///
/// A zero vector is returned unchanged. Callers must treat an unchanged zero
/// vector as invalid input; the quality gate rejects it because all of its
/// statistics are zero.
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let norm = norm_f64(v);
    if norm <= f64::from(ZERO_NORM_EPSILON) || !norm.is_finite() {
        return v.to_vec();
    }
    v.iter().map(|&x| (f64::from(x) / norm) as f32).collect()
}

/// Cosine similarity in [-1, 1], or an error for zero-norm or mismatched input.
pub fn try_cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, VectorError> {
    if a.len() != b.len() {
        return Err(VectorError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }

    let norm_a = norm_f64(a);
    let norm_b = norm_f64(b);
    let epsilon = f64::from(ZERO_NORM_EPSILON);
    if norm_a <= epsilon || norm_b <= epsilon {
        return Err(VectorError::ZeroVector);
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(&x, &y)| f64::from(x) * f64::from(y))
        .sum();
    Ok(((dot / (norm_a * norm_b)) as f32).clamp(-1.0, 1.0))
}

/// Cosine similarity that never fails.
///
/// Zero-norm or mismatched inputs are logged and score 0.0, which can never
/// pass a positive similarity threshold.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    match try_cosine_similarity(a, b) {
        Ok(similarity) => similarity,
        Err(e) => {
            tracing::warn!(error = %e, "cosine similarity on degenerate input, scoring 0.0");
            0.0
        }
    }
}

/// Cosine similarity clamped to [0, 1].
///
/// Anti-correlated faces carry no more identity evidence than orthogonal ones,
/// so matching works on this form.
pub fn clamped_similarity(a: &[f32], b: &[f32]) -> f32 {
    cosine_similarity(a, b).max(0.0)
}

fn mean(v: &[f32]) -> f64 {
    if v.is_empty() {
        return 0.0;
    }
    v.iter().map(|&x| f64::from(x)).sum::<f64>() / v.len() as f64
}

/// Population variance of the components of `v`.
pub fn variance(v: &[f32]) -> f32 {
    if v.is_empty() {
        return 0.0;
    }
    let mean = mean(v);
    let sum_sq: f64 = v
        .iter()
        .map(|&x| {
            let d = f64::from(x) - mean;
            d * d
        })
        .sum();
    (sum_sq / v.len() as f64) as f32
}

/// Population standard deviation of the components of `v`.
pub fn std_dev(v: &[f32]) -> f32 {
    variance(v).sqrt()
}

/// `max - min` over the components of `v`; 0.0 for an empty vector.
pub fn range(v: &[f32]) -> f32 {
    if v.is_empty() {
        return 0.0;
    }
    let min = v.iter().copied().fold(f32::INFINITY, f32::min);
    let max = v.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    max - min
}
