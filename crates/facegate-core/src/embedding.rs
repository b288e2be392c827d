use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::vector;

/// A face signature produced by the external embedding model.
///
/// Immutable once built: transformations such as [`Embedding::normalized`]
/// return a new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn norm(&self) -> f32 {
        vector::l2_norm(&self.values)
    }

    /// Unit-length copy. A zero embedding comes back unchanged.
    pub fn normalized(&self) -> Embedding {
        Embedding {
            values: vector::normalize(&self.values),
        }
    }

    /// Whether every component is finite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// SHA-256 of the little-endian component bytes, hex encoded.
    ///
    /// Audit records carry this digest instead of the raw signature.
    pub fn digest_hex(&self) -> String {
        let mut hasher = Sha256::new();
        for v in &self.values {
            hasher.update(v.to_le_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Optional contact details stored next to an enrolled embedding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContactInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Snapshot of an enrolled identity as read from the identity store.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledIdentity {
    pub identity_id: String,
    pub embedding: Embedding,
    pub contact: ContactInfo,
}

impl EnrolledIdentity {
    pub fn new(identity_id: impl Into<String>, embedding: Embedding) -> Self {
        Self {
            identity_id: identity_id.into(),
            embedding,
            contact: ContactInfo::default(),
        }
    }

    pub fn with_contact(mut self, contact: ContactInfo) -> Self {
        self.contact = contact;
        self
    }
}
