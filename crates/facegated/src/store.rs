use std::path::Path;

use async_trait::async_trait;
use facegate_core::{
    AuditRecord, ContactInfo, Embedding, EnrolledIdentity, IdentityStore, StoreError,
};
use thiserror::Error;
use tokio_rusqlite::Connection;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {actual} (expected {expected})")]
    InvalidEmbeddingDim { expected: usize, actual: usize },
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("audit serialization failed: {0}")]
    Audit(#[from] serde_json::Error),
}

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        StoreError::backend(e)
    }
}

/// SQLite-backed identity storage with AES-256-GCM encrypted embeddings.
///
/// A per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600). Each identity has exactly one row;
/// re-enrollment overwrites it. Completed authentication attempts are kept in
/// `audit_log` with the probe digest only.
#[derive(Clone)]
pub struct SqliteIdentityStore {
    conn: Connection,
    enc_key: [u8; 32],
    embedding_dim: usize,
}

impl SqliteIdentityStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path, embedding_dim: usize) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/facegate"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA foreign_keys = ON;
                 CREATE TABLE IF NOT EXISTS identities (
                     identity_id TEXT PRIMARY KEY,
                     embedding BLOB NOT NULL,
                     embedding_dim INTEGER NOT NULL,
                     display_name TEXT,
                     email TEXT,
                     phone TEXT,
                     enrolled_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS audit_log (
                     attempt_id TEXT PRIMARY KEY,
                     context TEXT NOT NULL,
                     at TEXT NOT NULL,
                     decision TEXT NOT NULL,
                     reason TEXT NOT NULL,
                     best_identity TEXT,
                     best_similarity REAL,
                     probe_digest TEXT
                 );
                 CREATE INDEX IF NOT EXISTS idx_audit_context ON audit_log(context, at);",
            )?;
            Ok(())
        })
        .await?;

        Ok(Self {
            conn,
            enc_key,
            embedding_dim,
        })
    }

    /// Insert or replace the identity's single record.
    pub async fn upsert(
        &self,
        identity_id: &str,
        embedding: &Embedding,
        contact: &ContactInfo,
    ) -> Result<(), DbError> {
        let blob = self.encrypt_embedding(embedding.values())?;
        let dim = embedding.len() as i64;
        let enrolled_at = chrono::Utc::now().to_rfc3339();
        let identity_id = identity_id.to_string();
        let contact = contact.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO identities
                         (identity_id, embedding, embedding_dim, display_name, email, phone, enrolled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        identity_id,
                        blob,
                        dim,
                        contact.display_name,
                        contact.email,
                        contact.phone,
                        enrolled_at
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn select(&self, identity_id: Option<String>) -> Result<Vec<EnrolledIdentity>, DbError> {
        type Row = (String, Vec<u8>, Option<String>, Option<String>, Option<String>);

        // Fetch raw rows from SQLite; decrypt outside the blocking closure
        let rows: Vec<Row> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_id, embedding, display_name, email, phone
                     FROM identities
                     WHERE ?1 IS NULL OR identity_id = ?1
                     ORDER BY identity_id",
                )?;
                let rows = stmt.query_map([&identity_id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut identities = Vec::with_capacity(rows.len());
        for (identity_id, blob, display_name, email, phone) in rows {
            let values = self.decrypt_embedding(&blob)?;
            identities.push(
                EnrolledIdentity::new(identity_id, Embedding::new(values)).with_contact(
                    ContactInfo {
                        display_name,
                        email,
                        phone,
                    },
                ),
            );
        }
        Ok(identities)
    }

    /// List enrolled identities (metadata only, no embeddings).
    pub async fn list(&self) -> Result<Vec<IdentityInfo>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT identity_id, display_name, email, phone, enrolled_at
                     FROM identities ORDER BY enrolled_at",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(IdentityInfo {
                        identity_id: row.get(0)?,
                        contact: ContactInfo {
                            display_name: row.get(1)?,
                            email: row.get(2)?,
                            phone: row.get(3)?,
                        },
                        enrolled_at: row.get(4)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(DbError::from)
    }

    pub async fn delete(&self, identity_id: &str) -> Result<bool, DbError> {
        let identity_id = identity_id.to_string();
        self.conn
            .call(move |conn| {
                let affected =
                    conn.execute("DELETE FROM identities WHERE identity_id = ?1", [&identity_id])?;
                Ok(affected > 0)
            })
            .await
            .map_err(DbError::from)
    }

    /// Count enrolled identities.
    pub async fn count(&self) -> Result<u64, DbError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(DbError::from)
    }

    pub async fn insert_audit(&self, record: &AuditRecord) -> Result<(), DbError> {
        let attempt_id = record.attempt_id.to_string();
        let context = record.context.clone();
        let at = record.at.to_rfc3339();
        let decision = record.decision.kind().to_string();
        let reason = serde_json::to_string(&record.reason)?;
        let best_identity = record.best_identity.clone();
        let best_similarity = record.best_similarity.map(f64::from);
        let probe_digest = record.probe_digest.clone();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO audit_log
                         (attempt_id, context, at, decision, reason, best_identity, best_similarity, probe_digest)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    rusqlite::params![
                        attempt_id,
                        context,
                        at,
                        decision,
                        reason,
                        best_identity,
                        best_similarity,
                        probe_digest
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Most recent audit entries for a context, newest first.
    pub async fn recent_audit(&self, context: &str, limit: u32) -> Result<Vec<AuditEntry>, DbError> {
        let context = context.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT attempt_id, at, decision, reason
                     FROM audit_log WHERE context = ?1
                     ORDER BY at DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![context, limit], |row| {
                    Ok(AuditEntry {
                        attempt_id: row.get(0)?,
                        at: row.get(1)?,
                        decision: row.get(2)?,
                        reason: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(DbError::from)
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Encrypt embedding values with AES-256-GCM.
    ///
    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_embedding(&self, values: &[f32]) -> Result<Vec<u8>, DbError> {
        validate_embedding_values(values, self.embedding_dim)?;
        let plaintext = embedding_to_bytes(values);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| DbError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_embedding(&self, blob: &[u8]) -> Result<Vec<f32>, DbError> {
        if blob.len() <= NONCE_LEN {
            return Err(DbError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| DbError::DecryptionFailed)?;

        bytes_to_embedding_strict(&plaintext, self.embedding_dim)
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn fetch_all_enrolled(&self) -> Result<Vec<EnrolledIdentity>, StoreError> {
        Ok(self.select(None).await?)
    }

    async fn fetch_one(&self, identity_id: &str) -> Result<Option<EnrolledIdentity>, StoreError> {
        Ok(self
            .select(Some(identity_id.to_string()))
            .await?
            .into_iter()
            .next())
    }

    async fn persist(
        &self,
        identity_id: &str,
        embedding: &Embedding,
        contact: &ContactInfo,
    ) -> Result<(), StoreError> {
        Ok(self.upsert(identity_id, embedding, contact).await?)
    }

    async fn remove(&self, identity_id: &str) -> Result<bool, StoreError> {
        Ok(self.delete(identity_id).await?)
    }

    async fn record_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        Ok(self.insert_audit(record).await?)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], DbError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(DbError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(DbError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(DbError::KeyIo)?;
        f.write_all(&key).map_err(DbError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding_strict(bytes: &[u8], dim: usize) -> Result<Vec<f32>, DbError> {
    if bytes.len() != dim * 4 {
        return Err(DbError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(dim);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| DbError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(DbError::InvalidEmbeddingValue);
        }
        values.push(v);
    }
    Ok(values)
}

fn validate_embedding_values(values: &[f32], dim: usize) -> Result<(), DbError> {
    if values.len() != dim {
        return Err(DbError::InvalidEmbeddingDim {
            expected: dim,
            actual: values.len(),
        });
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DbError::InvalidEmbeddingValue);
    }
    Ok(())
}

// ── Public types ──────────────────────────────────────────────────────────────

/// Metadata about an enrolled identity (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct IdentityInfo {
    pub identity_id: String,
    #[serde(flatten)]
    pub contact: ContactInfo,
    pub enrolled_at: String,
}

/// One row of the audit log as exposed to operators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditEntry {
    pub attempt_id: String,
    pub at: String,
    pub decision: String,
    /// JSON-encoded internal reason.
    pub reason: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
