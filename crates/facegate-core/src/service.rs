//! Async wiring of the decision core to an identity store.
//!
//! [`AuthService`] owns the per-context lockout registry and bounds every
//! store call with a timeout. For one attempt it:
//!
//! 1. locks the context's lockout state (held until the attempt completes),
//! 2. short-circuits if the context is locked out,
//! 3. runs the liveness and quality gates, still without store I/O,
//! 4. fetches the candidate snapshot and matches the probe,
//! 5. commits the single lockout update,
//! 6. hands the audit record to the store.
//!
//! Dropping the future at any point before step 5 leaves lockout state
//! untouched. A store failure is reported as
//! [`ServiceError::StoreUnavailable`], never as a no-match.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::authenticator::{AuthAttempt, Authenticator, EnrollRejection, Enrolled};
use crate::config::{AuthConfig, ConfigError};
use crate::decision::{AuditReason, AuditRecord, AuthOutcome, Decision};
use crate::embedding::{ContactInfo, Embedding, EnrolledIdentity};
use crate::liveness::{FrameSignals, Landmarks};
use crate::lockout::{Clock, LockoutRegistry, LockoutStatus, SystemClock};
use crate::producer::{EmbeddingProducer, FaceRegion, ProducerError};
use crate::store::{IdentityStore, StoreError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("identity store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("enrollment rejected: {0}")]
    EnrollRejected(#[from] EnrollRejection),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

pub struct AuthService<S, C = SystemClock> {
    authenticator: Authenticator,
    store: S,
    clock: C,
    lockouts: LockoutRegistry,
    store_timeout: Duration,
    /// Serializes enrollments so two concurrent enrolls cannot both pass the
    /// uniqueness gate against a snapshot that misses the other.
    enroll_lock: tokio::sync::Mutex<()>,
}

impl<S: IdentityStore> AuthService<S, SystemClock> {
    pub fn new(config: AuthConfig, store: S) -> Result<Self, ServiceError> {
        Self::with_clock(config, store, SystemClock)
    }
}

impl<S: IdentityStore, C: Clock> AuthService<S, C> {
    pub fn with_clock(config: AuthConfig, store: S, clock: C) -> Result<Self, ServiceError> {
        let store_timeout = config.store_timeout();
        Ok(Self {
            authenticator: Authenticator::new(config)?,
            store,
            clock,
            lockouts: LockoutRegistry::new(),
            store_timeout,
            enroll_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &AuthConfig {
        self.authenticator.config()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Number of contexts that have made at least one attempt.
    pub fn tracked_contexts(&self) -> usize {
        self.lockouts.len()
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, ServiceError> {
        match tokio::time::timeout(self.store_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "identity store call failed");
                Err(ServiceError::StoreUnavailable(e))
            }
            Err(_) => {
                tracing::error!(
                    timeout_ms = self.store_timeout.as_millis() as u64,
                    "identity store call timed out"
                );
                Err(ServiceError::StoreUnavailable(StoreError::Timeout(
                    self.store_timeout,
                )))
            }
        }
    }

    /// Validate and persist a new embedding for `identity_id`.
    pub async fn enroll(
        &self,
        identity_id: &str,
        embedding: &Embedding,
        contact: &ContactInfo,
    ) -> Result<Enrolled, ServiceError> {
        tracing::info!(identity = identity_id, "enroll requested");
        let _guard = self.enroll_lock.lock().await;

        let existing = self.bounded(self.store.fetch_all_enrolled()).await?;
        let enrolled = self
            .authenticator
            .enroll(identity_id, embedding, &existing)
            .map_err(|rejection| {
                tracing::warn!(identity = identity_id, %rejection, "enroll rejected");
                rejection
            })?;

        self.bounded(
            self.store
                .persist(&enrolled.identity_id, &enrolled.embedding, contact),
        )
        .await?;

        tracing::info!(identity = identity_id, "enrolled successfully");
        Ok(enrolled)
    }

    /// Delete an enrolled identity.
    pub async fn remove(&self, identity_id: &str) -> Result<bool, ServiceError> {
        let removed = self.bounded(self.store.remove(identity_id)).await?;
        if removed {
            tracing::info!(identity = identity_id, "identity removed");
        } else {
            tracing::warn!(identity = identity_id, "identity not found");
        }
        Ok(removed)
    }

    /// 1:N authentication against every enrolled identity.
    pub async fn authenticate(
        &self,
        context: &str,
        attempt: AuthAttempt,
    ) -> Result<Decision, ServiceError> {
        self.run(context, None, move || Ok(attempt)).await
    }

    /// 1:1 verification of a claimed identity. The cross-identity gates still
    /// run against the whole store.
    pub async fn verify(
        &self,
        context: &str,
        claimed_identity: &str,
        attempt: AuthAttempt,
    ) -> Result<Decision, ServiceError> {
        self.run(context, Some(claimed_identity), move || Ok(attempt))
            .await
    }

    /// Run the injected embedding model on `face`, then authenticate 1:N.
    ///
    /// The model only runs once the lockout check and the liveness gate have
    /// passed. A model failure is reported as a low-quality embedding.
    pub async fn authenticate_capture(
        &self,
        context: &str,
        producer: &mut dyn EmbeddingProducer,
        face: &FaceRegion,
        signals: FrameSignals,
        landmarks: Vec<Landmarks>,
    ) -> Result<Decision, ServiceError> {
        let authenticator = &self.authenticator;
        self.run(context, None, move || {
            authenticator.check_liveness(context, &signals, &landmarks)?;
            let probe = face
                .validate()
                .and_then(|()| producer.produce(face))
                .map_err(|e| producer_failed(context, e))?;
            Ok(AuthAttempt::new(probe, signals).with_landmarks(landmarks))
        })
        .await
    }

    /// Current lockout phase of `context`.
    pub async fn lockout_status(&self, context: &str) -> LockoutStatus {
        let handle = self.lockouts.context(context);
        let mut state = handle.lock().await;
        state.status(self.clock.now(), self.authenticator.lockout_policy())
    }

    async fn run<F>(
        &self,
        context: &str,
        claimed: Option<&str>,
        make_attempt: F,
    ) -> Result<Decision, ServiceError>
    where
        F: FnOnce() -> Result<AuthAttempt, AuthOutcome>,
    {
        let handle = self.lockouts.context(context);
        let mut lockout = handle.lock().await;

        if let Some(outcome) =
            self.authenticator
                .lockout_outcome(context, &mut lockout, self.clock.now())
        {
            drop(lockout);
            return Ok(self.finish(outcome).await);
        }

        let attempt = match make_attempt() {
            Ok(attempt) => attempt,
            Err(rejected) => {
                let outcome = self.authenticator.commit(
                    context,
                    None,
                    rejected,
                    &mut lockout,
                    self.clock.now(),
                );
                drop(lockout);
                return Ok(self.finish(outcome).await);
            }
        };

        // Cheap gates first: a bad capture never costs a store round trip.
        let probe = match self.authenticator.precheck(context, &attempt) {
            Ok(probe) => probe,
            Err(rejected) => {
                let outcome = self.authenticator.commit(
                    context,
                    Some(&attempt.probe),
                    rejected,
                    &mut lockout,
                    self.clock.now(),
                );
                drop(lockout);
                return Ok(self.finish(outcome).await);
            }
        };

        let population = self.bounded(self.store.fetch_all_enrolled()).await?;
        let claimed_record = match claimed {
            Some(identity_id) => Some(self.bounded(self.store.fetch_one(identity_id)).await?),
            None => None,
        };
        let candidates: &[EnrolledIdentity] = match &claimed_record {
            Some(Some(record)) => std::slice::from_ref(record),
            Some(None) => &[],
            None => &population,
        };

        let outcome = self
            .authenticator
            .match_probe(context, &probe, candidates, &population);
        let outcome = self.authenticator.commit(
            context,
            Some(&attempt.probe),
            outcome,
            &mut lockout,
            self.clock.now(),
        );
        drop(lockout);

        Ok(self.finish(outcome).await)
    }

    async fn finish(&self, outcome: AuthOutcome) -> Decision {
        if let Err(e) = self.bounded(self.store.record_audit(&outcome.audit)).await {
            tracing::warn!(
                attempt_id = %outcome.audit.attempt_id,
                error = %e,
                "failed to persist audit record"
            );
        }
        outcome.decision
    }
}

fn producer_failed(context: &str, e: ProducerError) -> AuthOutcome {
    tracing::warn!(context, error = %e, "embedding producer failed");
    let decision = Decision::RejectedLowQualityEmbedding;
    AuthOutcome {
        audit: AuditRecord::new(
            context,
            decision.clone(),
            AuditReason::ProducerFailed {
                message: e.to_string(),
            },
        ),
        decision,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::lockout::ManualClock;
    use crate::store::MemoryStore;
    use crate::test_support::{scene, spread};

    /// MemoryStore wrapper that counts fetches and can be switched offline.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fetches: AtomicUsize,
        offline: AtomicBool,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("connection refused")]
    struct Offline;

    #[async_trait]
    impl IdentityStore for Arc<FlakyStore> {
        async fn fetch_all_enrolled(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(StoreError::backend(Offline));
            }
            self.inner.fetch_all_enrolled().await
        }

        async fn fetch_one(
            &self,
            identity_id: &str,
        ) -> Result<Option<EnrolledIdentity>, StoreError> {
            self.inner.fetch_one(identity_id).await
        }

        async fn persist(
            &self,
            identity_id: &str,
            embedding: &Embedding,
            contact: &ContactInfo,
        ) -> Result<(), StoreError> {
            self.inner.persist(identity_id, embedding, contact).await
        }

        async fn remove(&self, identity_id: &str) -> Result<bool, StoreError> {
            self.inner.remove(identity_id).await
        }

        async fn record_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
            self.inner.record_audit(record).await
        }
    }

    /// Store whose fetch never completes.
    struct HangingStore;

    #[async_trait]
    impl IdentityStore for HangingStore {
        async fn fetch_all_enrolled(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
            std::future::pending().await
        }

        async fn fetch_one(&self, _: &str) -> Result<Option<EnrolledIdentity>, StoreError> {
            std::future::pending().await
        }

        async fn persist(&self, _: &str, _: &Embedding, _: &ContactInfo) -> Result<(), StoreError> {
            Ok(())
        }

        async fn remove(&self, _: &str) -> Result<bool, StoreError> {
            Ok(false)
        }
    }

    struct FixedProducer {
        output: Option<Embedding>,
        calls: usize,
    }

    impl FixedProducer {
        fn new(output: Option<Embedding>) -> Self {
            Self { output, calls: 0 }
        }
    }

    impl EmbeddingProducer for FixedProducer {
        fn produce(&mut self, _face: &FaceRegion) -> Result<Embedding, ProducerError> {
            self.calls += 1;
            self.output
                .clone()
                .ok_or_else(|| ProducerError::Model("no output tensor".into()))
        }
    }

    fn eyes_closed() -> FrameSignals {
        FrameSignals {
            left_eye_open: 0.0,
            right_eye_open: 0.0,
            ..FrameSignals::frontal()
        }
    }

    fn face() -> FaceRegion {
        FaceRegion {
            width: 4,
            height: 4,
            rgb: vec![128; 48],
        }
    }

    async fn seeded(similarities: &[f32]) -> (Arc<FlakyStore>, Embedding) {
        let s = scene(512, similarities);
        let store = Arc::new(FlakyStore::default());
        for identity in &s.identities {
            store
                .inner
                .persist(&identity.identity_id, &identity.embedding, &ContactInfo::default())
                .await
                .unwrap();
        }
        (store, s.probe)
    }

    fn attempt(probe: Embedding) -> AuthAttempt {
        AuthAttempt::new(probe, FrameSignals::frontal())
    }

    #[tokio::test]
    async fn test_enroll_then_authenticate() {
        let store = Arc::new(FlakyStore::default());
        let service = AuthService::new(AuthConfig::default(), store.clone()).unwrap();
        let face = spread(512, 123);

        service
            .enroll("alice", &face, &ContactInfo::default())
            .await
            .unwrap();
        service
            .enroll("bob", &spread(512, 456), &ContactInfo::default())
            .await
            .unwrap();

        let decision = service.authenticate("phone-1", attempt(face)).await.unwrap();
        assert_eq!(
            decision,
            Decision::Accepted {
                identity_id: "alice".into()
            }
        );
        assert_eq!(store.inner.audit_log().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_enrollment_rejected() {
        let store = Arc::new(FlakyStore::default());
        let service = AuthService::new(AuthConfig::default(), store).unwrap();
        let face = spread(512, 5);
        service
            .enroll("alice", &face, &ContactInfo::default())
            .await
            .unwrap();
        let err = service
            .enroll("mallory", &face, &ContactInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::EnrollRejected(EnrollRejection::Duplicate { .. })
        ));
    }

    #[tokio::test]
    async fn test_lockout_skips_store_and_expires() {
        let (store, probe) = seeded(&[0.93, 0.2]).await;
        let clock = ManualClock::new();
        let service =
            AuthService::with_clock(AuthConfig::default(), store.clone(), clock.clone()).unwrap();
        let impostor = spread(512, 999);

        for _ in 0..5 {
            let d = service
                .authenticate("phone-1", attempt(impostor.clone()))
                .await
                .unwrap();
            assert_eq!(d, Decision::RejectedNoMatch);
        }
        let fetches = store.fetches.load(Ordering::SeqCst);

        let d = service
            .authenticate("phone-1", attempt(probe.clone()))
            .await
            .unwrap();
        assert!(matches!(d, Decision::RejectedLockout { .. }));
        assert_eq!(store.fetches.load(Ordering::SeqCst), fetches);

        // Other contexts are unaffected.
        let d = service
            .authenticate("phone-2", attempt(probe.clone()))
            .await
            .unwrap();
        assert!(d.is_accepted());

        clock.advance(Duration::from_secs(300));
        assert_eq!(
            service.lockout_status("phone-1").await,
            LockoutStatus::Normal { failed_attempts: 0 }
        );
        let d = service.authenticate("phone-1", attempt(probe)).await.unwrap();
        assert!(d.is_accepted());
    }

    #[tokio::test]
    async fn test_store_failure_is_not_a_rejection() {
        let (store, probe) = seeded(&[0.93]).await;
        let service = AuthService::new(AuthConfig::default(), store.clone()).unwrap();
        store.offline.store(true, Ordering::SeqCst);

        for _ in 0..10 {
            let err = service
                .authenticate("phone-1", attempt(probe.clone()))
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::StoreUnavailable(_)));
        }
        assert_eq!(
            service.lockout_status("phone-1").await,
            LockoutStatus::Normal { failed_attempts: 0 }
        );

        store.offline.store(false, Ordering::SeqCst);
        assert!(service
            .authenticate("phone-1", attempt(probe))
            .await
            .unwrap()
            .is_accepted());
    }

    #[tokio::test]
    async fn test_cheap_gates_run_before_store() {
        let (store, probe) = seeded(&[0.93]).await;
        let service = AuthService::new(AuthConfig::default(), store.clone()).unwrap();
        store.offline.store(true, Ordering::SeqCst);

        let d = service
            .authenticate("phone-1", AuthAttempt::new(probe.clone(), eyes_closed()))
            .await
            .unwrap();
        assert_eq!(d, Decision::RejectedLivenessFailed);

        let d = service
            .authenticate("phone-1", attempt(Embedding::new(vec![0.5; 512])))
            .await
            .unwrap();
        assert_eq!(d, Decision::RejectedLowQualityEmbedding);

        let d = service
            .verify("phone-1", "id-0", AuthAttempt::new(probe, eyes_closed()))
            .await
            .unwrap();
        assert_eq!(d, Decision::RejectedLivenessFailed);

        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(
            service.lockout_status("phone-1").await,
            LockoutStatus::Normal { failed_attempts: 0 }
        );
    }

    #[tokio::test]
    async fn test_capture_liveness_before_producer() {
        let (store, probe) = seeded(&[0.93]).await;
        let service = AuthService::new(AuthConfig::default(), store.clone()).unwrap();
        store.offline.store(true, Ordering::SeqCst);

        let mut producer = FixedProducer::new(Some(probe));
        let d = service
            .authenticate_capture("phone-1", &mut producer, &face(), eyes_closed(), vec![])
            .await
            .unwrap();
        assert_eq!(d, Decision::RejectedLivenessFailed);
        assert_eq!(producer.calls, 0);
        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout() {
        let service = AuthService::new(AuthConfig::default(), HangingStore).unwrap();
        let err = service
            .authenticate("phone-1", attempt(spread(512, 1)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::StoreUnavailable(StoreError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_verify_claimed_identity() {
        let (store, probe) = seeded(&[0.93, 0.2]).await;
        let service = AuthService::new(AuthConfig::default(), store).unwrap();

        let d = service
            .verify("phone-1", "id-0", attempt(probe.clone()))
            .await
            .unwrap();
        assert_eq!(
            d,
            Decision::Accepted {
                identity_id: "id-0".into()
            }
        );

        // Claiming the wrong identity fails the absolute threshold.
        let d = service
            .verify("phone-1", "id-1", attempt(probe.clone()))
            .await
            .unwrap();
        assert_eq!(d, Decision::RejectedNoMatch);

        let d = service
            .verify("phone-1", "nobody", attempt(probe))
            .await
            .unwrap();
        assert_eq!(d, Decision::RejectedNoMatch);
    }

    #[tokio::test]
    async fn test_capture_runs_producer() {
        let (store, probe) = seeded(&[0.93]).await;
        let service = AuthService::new(AuthConfig::default(), store.clone()).unwrap();

        let mut producer = FixedProducer::new(Some(probe));
        let d = service
            .authenticate_capture("phone-1", &mut producer, &face(), FrameSignals::frontal(), vec![])
            .await
            .unwrap();
        assert!(d.is_accepted());

        let mut broken = FixedProducer::new(None);
        let d = service
            .authenticate_capture("phone-1", &mut broken, &face(), FrameSignals::frontal(), vec![])
            .await
            .unwrap();
        assert_eq!(d, Decision::RejectedLowQualityEmbedding);

        let audit = store.inner.audit_log();
        assert!(matches!(
            audit.last().unwrap().reason,
            AuditReason::ProducerFailed { .. }
        ));
    }

    #[tokio::test]
    async fn test_concurrent_attempts_respect_limit() {
        let (store, _) = seeded(&[0.93]).await;
        let service = Arc::new(AuthService::new(AuthConfig::default(), store).unwrap());
        let impostor = spread(512, 999);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let service = service.clone();
            let probe = impostor.clone();
            tasks.push(tokio::spawn(async move {
                service.authenticate("phone-1", attempt(probe)).await.unwrap()
            }));
        }

        let mut no_match = 0;
        let mut locked = 0;
        for task in tasks {
            match task.await.unwrap() {
                Decision::RejectedNoMatch => no_match += 1,
                Decision::RejectedLockout { .. } => locked += 1,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(no_match, 5);
        assert_eq!(locked, 15);
    }
}
