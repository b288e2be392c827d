//! Deterministic embedding fixtures shared by unit tests.

use crate::embedding::{Embedding, EnrolledIdentity};
use crate::vector;

fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Pseudo-random components in [-1, 1]; passes the quality gate once normalized.
pub fn spread(len: usize, seed: u32) -> Embedding {
    let values = (0..len)
        .map(|i| {
            let bits = mix((u64::from(seed) << 32) | i as u64);
            (bits % 2001) as f32 / 1000.0 - 1.0
        })
        .collect();
    Embedding::new(values)
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `count` orthonormal vectors of dimension `len` (Gram-Schmidt over `spread`).
pub fn orthonormal(len: usize, count: usize) -> Vec<Vec<f32>> {
    let mut basis: Vec<Vec<f32>> = Vec::with_capacity(count);
    for seed in 0..count {
        let mut v = spread(len, seed as u32 + 1).values().to_vec();
        for b in &basis {
            let proj = dot(&v, b);
            for (x, y) in v.iter_mut().zip(b) {
                *x -= proj * y;
            }
        }
        basis.push(vector::normalize(&v));
    }
    basis
}

/// A probe plus identities whose similarity to the probe is exactly
/// `similarities[i]` (up to float error). Identities are named `id-0`, `id-1`...
pub struct Scene {
    pub probe: Embedding,
    pub identities: Vec<EnrolledIdentity>,
}

pub fn scene(len: usize, similarities: &[f32]) -> Scene {
    let basis = orthonormal(len, similarities.len() + 1);
    let probe = &basis[0];
    let identities = similarities
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let w = &basis[i + 1];
            let rest = (1.0 - s * s).max(0.0).sqrt();
            let values = probe.iter().zip(w).map(|(p, q)| s * p + rest * q).collect();
            EnrolledIdentity::new(format!("id-{i}"), Embedding::new(values))
        })
        .collect();
    Scene {
        probe: Embedding::new(probe.clone()),
        identities,
    }
}

#[test]
fn scene_similarities_match_request() {
    let s = scene(512, &[0.9, 0.5, 0.1]);
    for (identity, expected) in s.identities.iter().zip([0.9f32, 0.5, 0.1]) {
        let sim = vector::cosine_similarity(s.probe.values(), identity.embedding.values());
        assert!((sim - expected).abs() < 1e-4, "{sim} vs {expected}");
    }
}
