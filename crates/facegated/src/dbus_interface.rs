use std::sync::Arc;

use facegate_core::{
    remaining_secs, AuthAttempt, AuthService, ContactInfo, Embedding, EnrollRejection,
    LockoutStatus, ServiceError,
};
use zbus::interface;

use crate::config::Config;
use crate::store::SqliteIdentityStore;

/// Shared state accessible by D-Bus method handlers.
///
/// [`AuthService`] does its own per-context locking, so handlers share it
/// without an outer mutex.
pub struct AppState {
    pub config: Config,
    pub service: AuthService<SqliteIdentityStore>,
}

/// D-Bus interface for the facegate daemon.
///
/// Bus name: org.facegate.Facegate1
/// Object path: /org/facegate/Facegate1
pub struct FacegateService {
    pub state: Arc<AppState>,
}

/// Retrieve the UID of the D-Bus peer identified by `sender_str` (a unique bus name).
async fn get_caller_uid(sender_str: &str, conn: &zbus::Connection) -> zbus::fdo::Result<u32> {
    let dbus_proxy = zbus::fdo::DBusProxy::new(conn)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    let bus_name = zbus::names::BusName::try_from(sender_str)
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
    dbus_proxy
        .get_connection_unix_user(bus_name)
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

impl FacegateService {
    /// UID of the calling peer, or `None` on the session bus (development
    /// mode), where callers are not distinguished.
    async fn caller(
        &self,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
    ) -> zbus::fdo::Result<Option<u32>> {
        if self.state.config.session_bus {
            return Ok(None);
        }
        let sender = header
            .sender()
            .ok_or_else(|| zbus::fdo::Error::Failed("no sender in message".to_string()))?;
        get_caller_uid(sender.as_str(), conn).await.map(Some)
    }

    /// Enrollment, removal and the audit log are root-only on the system bus.
    async fn require_admin(
        &self,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
        method: &str,
    ) -> zbus::fdo::Result<()> {
        let caller = self.caller(header, conn).await?;
        check_admin(caller, method)
    }

    /// Lockout context for a call; see [`lockout_context`].
    async fn context_for(
        &self,
        header: &zbus::message::Header<'_>,
        conn: &zbus::Connection,
        requested: &str,
    ) -> zbus::fdo::Result<String> {
        let caller = self.caller(header, conn).await?;
        Ok(lockout_context(caller, requested))
    }
}

#[interface(name = "org.facegate.Facegate1")]
impl FacegateService {
    /// Enroll (or re-enroll) an identity from an embedding produced by the
    /// capture pipeline. Empty contact strings are stored as absent.
    ///
    /// Returns the identity id.
    async fn enroll(
        &self,
        identity: &str,
        embedding: Vec<f64>,
        display_name: &str,
        email: &str,
        phone: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(identity, dims = embedding.len(), "enroll requested");
        self.require_admin(&header, conn, "Enroll").await?;

        let contact = contact_from(display_name, email, phone);
        let enrolled = self
            .state
            .service
            .enroll(identity, &embedding_from(&embedding), &contact)
            .await
            .map_err(to_fdo)?;
        Ok(enrolled.identity_id)
    }

    /// 1:N authentication. `attempt` is a JSON-encoded attempt (probe,
    /// frame signals, optional landmark sequence).
    ///
    /// Returns the decision as JSON.
    async fn authenticate(
        &self,
        context: &str,
        attempt: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let context = self.context_for(&header, conn, context).await?;
        tracing::info!(context = %context, "authenticate requested");
        let attempt = parse_attempt(attempt)?;
        let decision = self
            .state
            .service
            .authenticate(&context, attempt)
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&decision).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// 1:1 verification of a claimed identity.
    async fn verify(
        &self,
        context: &str,
        identity: &str,
        attempt: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let context = self.context_for(&header, conn, context).await?;
        tracing::info!(context = %context, identity, "verify requested");
        let attempt = parse_attempt(attempt)?;
        let decision = self
            .state
            .service
            .verify(&context, identity, attempt)
            .await
            .map_err(to_fdo)?;
        serde_json::to_string(&decision).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let service = &self.state.service;
        let identity_count = service.store().count().await.unwrap_or(0);
        let config = service.config();

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities_enrolled": identity_count,
            "embedding_length": config.embedding_length,
            "thresholds": config.thresholds,
            "max_failed_attempts": config.max_failed_attempts,
            "lockout_duration_secs": config.lockout_duration_secs,
            "liveness_profile": config.liveness.profile,
            "tracked_contexts": service.tracked_contexts(),
        })
        .to_string())
    }

    /// List enrolled identities (metadata only) as JSON.
    async fn list_identities(&self) -> zbus::fdo::Result<String> {
        tracing::info!("list_identities requested");
        let identities = self
            .state
            .service
            .store()
            .list()
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&identities).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Remove an enrolled identity.
    async fn remove_identity(
        &self,
        identity: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<bool> {
        tracing::info!(identity, "remove_identity requested");
        self.require_admin(&header, conn, "RemoveIdentity").await?;
        self.state.service.remove(identity).await.map_err(to_fdo)
    }

    /// Lockout phase of an authentication context as JSON. Non-root callers
    /// on the system bus only ever see their own context.
    async fn lockout_status(
        &self,
        context: &str,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        let context = self.context_for(&header, conn, context).await?;
        let status = self.state.service.lockout_status(&context).await;
        Ok(lockout_json(status).to_string())
    }

    /// Recent audit entries for an authentication context as JSON.
    ///
    /// Entries carry gate-level detail, so this is root-only.
    async fn audit_log(
        &self,
        context: &str,
        limit: u32,
        #[zbus(header)] header: zbus::message::Header<'_>,
        #[zbus(connection)] conn: &zbus::Connection,
    ) -> zbus::fdo::Result<String> {
        self.require_admin(&header, conn, "AuditLog").await?;
        let entries = self
            .state
            .service
            .store()
            .recent_audit(context, limit)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&entries).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }
}

fn check_admin(caller: Option<u32>, method: &str) -> zbus::fdo::Result<()> {
    match caller {
        None | Some(0) => Ok(()),
        Some(caller_uid) => {
            tracing::warn!(method, caller_uid, "non-root caller rejected");
            Err(zbus::fdo::Error::AccessDenied(format!(
                "only root may call {method}"
            )))
        }
    }
}

/// Lockout context an attempt is charged to.
///
/// An unprivileged caller could otherwise spread failures over fresh context
/// names, so on the system bus a non-root caller is always bound to its UID.
/// Root (the login manager) keeps per-device contexts under its own prefix.
/// The session bus takes the requested name as-is.
fn lockout_context(caller: Option<u32>, requested: &str) -> String {
    match caller {
        None => requested.to_string(),
        Some(0) => format!("root:{requested}"),
        Some(uid) => format!("uid:{uid}"),
    }
}

fn embedding_from(values: &[f64]) -> Embedding {
    Embedding::new(values.iter().map(|&v| v as f32).collect())
}

fn contact_from(display_name: &str, email: &str, phone: &str) -> ContactInfo {
    let field = |s: &str| (!s.is_empty()).then(|| s.to_string());
    ContactInfo {
        display_name: field(display_name),
        email: field(email),
        phone: field(phone),
    }
}

fn parse_attempt(json: &str) -> zbus::fdo::Result<AuthAttempt> {
    serde_json::from_str(json)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("malformed attempt: {e}")))
}

fn lockout_json(status: LockoutStatus) -> serde_json::Value {
    match status {
        LockoutStatus::Normal { failed_attempts } => serde_json::json!({
            "locked_out": false,
            "failed_attempts": failed_attempts,
        }),
        LockoutStatus::LockedOut { remaining } => serde_json::json!({
            "locked_out": true,
            "remaining_secs": remaining_secs(remaining),
        }),
    }
}

/// Map a service error onto a D-Bus error. Duplicate enrollments are
/// reported without naming the identity they collide with.
fn to_fdo(err: ServiceError) -> zbus::fdo::Error {
    match err {
        ServiceError::EnrollRejected(EnrollRejection::Duplicate { .. }) => {
            zbus::fdo::Error::Failed("enrollment rejected: duplicate face".to_string())
        }
        ServiceError::EnrollRejected(EnrollRejection::LowQuality(rejection)) => {
            zbus::fdo::Error::InvalidArgs(format!("enrollment rejected: {rejection}"))
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}
