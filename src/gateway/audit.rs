//! Audit logging for authentication events.
//!
//! Every event is emitted via `tracing::info!` as a JSON blob in the `audit`
//! field so log aggregators can index it without parsing free text.
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `login.succeeded` | Credentials verified and a session token issued |
//! | `login.failed` | Verification failed (bad credentials, provider outage) |
//! | `login.rate_limited` | A public auth route rejected a client for too many attempts |
//! | `session.revoked` | A session was logged out |
//! | `access.denied` | A valid session lacked the role or team a route requires |
//! | `password.changed` | A local account's password was replaced |
//! | `password.rejected` | A password change failed |

use serde::Serialize;

use crate::error::AuthError;
use crate::token::{IssuedToken, SessionToken};
use crate::verifier::Strategy;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"login.succeeded"`).
    pub event: &'static str,
    /// Subject the event concerns, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Verification strategy used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<&'static str>,
    /// Session token id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_jti: Option<String>,
    /// Client key (peer or forwarded address).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Request path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Error code for failure events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl AuditEvent {
    fn new(event: &'static str) -> Self {
        Self {
            event,
            subject: None,
            strategy: None,
            token_jti: None,
            client: None,
            path: None,
            reason: None,
        }
    }

    /// Construct a `login.succeeded` event.
    #[must_use]
    pub fn login_succeeded(subject: &str, strategy: Strategy, token: &IssuedToken) -> Self {
        Self {
            subject: Some(subject.to_string()),
            strategy: Some(strategy.as_str()),
            token_jti: Some(token.token_id.clone()),
            ..Self::new("login.succeeded")
        }
    }

    /// Construct a `login.failed` event. `subject` is the claimed username,
    /// absent for authorization-code logins.
    #[must_use]
    pub fn login_failed(subject: Option<&str>, strategy: Option<Strategy>, error: &AuthError) -> Self {
        Self {
            subject: subject.map(str::to_string),
            strategy: strategy.map(Strategy::as_str),
            reason: Some(error.code()),
            ..Self::new("login.failed")
        }
    }

    /// Construct a `login.rate_limited` event.
    #[must_use]
    pub fn rate_limited(client: &str, path: &str) -> Self {
        Self {
            client: Some(client.to_string()),
            path: Some(path.to_string()),
            ..Self::new("login.rate_limited")
        }
    }

    /// Construct a `session.revoked` event.
    #[must_use]
    pub fn revoked(session: &SessionToken) -> Self {
        Self {
            subject: Some(session.subject_id().to_string()),
            token_jti: Some(session.token_id.clone()),
            ..Self::new("session.revoked")
        }
    }

    /// Construct an `access.denied` event.
    #[must_use]
    pub fn access_denied(subject: &str, path: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            path: Some(path.to_string()),
            reason: Some(AuthError::AuthorizationDenied.code()),
            ..Self::new("access.denied")
        }
    }

    /// Construct a `password.changed` event.
    #[must_use]
    pub fn password_changed(subject: &str) -> Self {
        Self {
            subject: Some(subject.to_string()),
            ..Self::new("password.changed")
        }
    }

    /// Construct a `password.rejected` event.
    #[must_use]
    pub fn password_rejected(subject: &str, error: &AuthError) -> Self {
        Self {
            subject: Some(subject.to_string()),
            reason: Some(error.code()),
            ..Self::new("password.rejected")
        }
    }
}

/// Emit an audit event via `tracing::info!`:
///
/// ```text
/// INFO authgate::gateway::audit audit={"event":"login.succeeded","subject":"alice",...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "authgate audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
