//! Identity store collaborator.
//!
//! The core only reads snapshots of enrolled identities and asks the store to
//! persist freshly enrolled embeddings. Backends decide their own retry
//! policy; the core never retries a store call.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::decision::AuditRecord;
use crate::embedding::{ContactInfo, Embedding, EnrolledIdentity};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("identity store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("identity store call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl StoreError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Snapshot of every enrolled identity.
    async fn fetch_all_enrolled(&self) -> Result<Vec<EnrolledIdentity>, StoreError>;

    async fn fetch_one(&self, identity_id: &str) -> Result<Option<EnrolledIdentity>, StoreError>;

    /// Persist an embedding for `identity_id`, replacing any previous record.
    async fn persist(
        &self,
        identity_id: &str,
        embedding: &Embedding,
        contact: &ContactInfo,
    ) -> Result<(), StoreError>;

    /// Delete an identity. Returns whether it existed.
    async fn remove(&self, identity_id: &str) -> Result<bool, StoreError>;

    /// Keep an audit record of a completed attempt. Stores without an audit
    /// table drop it; the service has already logged it.
    async fn record_audit(&self, _record: &AuditRecord) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Process-local store, ordered by identity id.
#[derive(Debug, Default)]
pub struct MemoryStore {
    identities: Mutex<BTreeMap<String, EnrolledIdentity>>,
    audit: Mutex<Vec<AuditRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit records kept so far.
    pub fn audit_log(&self) -> Vec<AuditRecord> {
        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn identities(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, EnrolledIdentity>> {
        self.identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn fetch_all_enrolled(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        Ok(self.identities().values().cloned().collect())
    }

    async fn fetch_one(&self, identity_id: &str) -> Result<Option<EnrolledIdentity>, StoreError> {
        Ok(self.identities().get(identity_id).cloned())
    }

    async fn persist(
        &self,
        identity_id: &str,
        embedding: &Embedding,
        contact: &ContactInfo,
    ) -> Result<(), StoreError> {
        let record =
            EnrolledIdentity::new(identity_id, embedding.clone()).with_contact(contact.clone());
        self.identities().insert(identity_id.to_string(), record);
        Ok(())
    }

    async fn remove(&self, identity_id: &str) -> Result<bool, StoreError> {
        Ok(self.identities().remove(identity_id).is_some())
    }

    async fn record_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.audit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
