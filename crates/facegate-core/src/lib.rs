//! Facegate decision core.
//!
//! Decides, from a face embedding produced by an external model, whether a
//! login attempt belongs to an enrolled identity:
//!
//! camera frame → (external model) → [`quality`] → [`liveness`] →
//! [`matcher`] → [`security`] → [`lockout`] update → [`Decision`].
//!
//! [`Authenticator`] sequences the pure pipeline over in-memory snapshots;
//! [`AuthService`] adds the identity store, store timeouts, per-context
//! lockout locking and audit persistence.

pub mod authenticator;
pub mod config;
pub mod decision;
pub mod embedding;
pub mod liveness;
pub mod lockout;
pub mod matcher;
pub mod producer;
pub mod quality;
pub mod security;
pub mod service;
pub mod store;
pub mod vector;

#[cfg(test)]
mod test_support;

pub use authenticator::{AuthAttempt, Authenticator, EnrollRejection, Enrolled};
pub use config::{AuthConfig, ConfigError, LivenessConfig, SecurityThresholds};
pub use decision::{remaining_secs, AuditReason, AuditRecord, AuthOutcome, Decision};
pub use embedding::{ContactInfo, Embedding, EnrolledIdentity};
pub use liveness::{FrameSignals, HeadPose, Landmarks, LivenessProfile, LivenessRejection};
pub use lockout::{Clock, LockoutPolicy, LockoutState, LockoutStatus, ManualClock, SystemClock};
pub use matcher::MatchResult;
pub use producer::{EmbeddingProducer, FaceRegion, ProducerError};
pub use quality::QualityRejection;
pub use security::{Gate, GateReport, SecurityVerdict};
pub use service::{AuthService, ServiceError};
pub use store::{IdentityStore, MemoryStore, StoreError};
