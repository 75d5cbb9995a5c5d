//! Login, logout and password-change orchestration.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::AuthError;
use crate::gateway::audit::{self, AuditEvent};
use crate::identity::Identity;
use crate::token::{RevocationList, SessionToken, TokenCodec};
use crate::upstream::UpstreamCredentialCache;
use crate::verifier::{CredentialVerifier, Credentials, Strategy};

/// Result of a successful login.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedSession {
    /// Signed session token
    pub jwt: String,
    /// When the token expires
    pub expires_at: DateTime<Utc>,
}

/// Composes verification, token issuance and revocation into the public
/// authentication flows.
pub struct AuthGateway {
    verifier: Arc<CredentialVerifier>,
    codec: Arc<TokenCodec>,
    revocations: Arc<RevocationList>,
    upstream: UpstreamCredentialCache,
    session_ttl: Duration,
    verify_timeout: Duration,
}

impl AuthGateway {
    /// Create the gateway.
    #[must_use]
    pub fn new(
        verifier: Arc<CredentialVerifier>,
        codec: Arc<TokenCodec>,
        revocations: Arc<RevocationList>,
        upstream: UpstreamCredentialCache,
        session_ttl: Duration,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            verifier,
            codec,
            revocations,
            upstream,
            session_ttl,
            verify_timeout,
        }
    }

    /// Verifier behind this gateway.
    #[must_use]
    pub fn verifier(&self) -> &Arc<CredentialVerifier> {
        &self.verifier
    }

    /// Verify `credentials` and issue a session token.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] for rejected credentials
    /// - [`AuthError::UpstreamUnavailable`] when the directory or provider
    ///   fails or verification exceeds the verify timeout
    pub async fn authenticate(
        &self,
        credentials: Credentials,
    ) -> Result<AuthenticatedSession, AuthError> {
        let claimed = match &credentials {
            Credentials::Password { username, .. } => Some(username.as_str()),
            Credentials::AuthorizationCode { .. } => None,
        };
        let strategy = self.verifier.strategy_for(&credentials).ok();

        match self.verify_and_issue(&credentials).await {
            Ok((identity, strategy, session)) => {
                info!(subject = %identity.subject_id, strategy = %strategy, "Login succeeded");
                Ok(session)
            }
            Err(e) => {
                warn!(
                    subject = claimed.unwrap_or("-"),
                    strategy = strategy.map_or("-", Strategy::as_str),
                    error = %e,
                    "Login failed"
                );
                audit::emit(&AuditEvent::login_failed(claimed, strategy, &e));
                Err(e)
            }
        }
    }

    /// Exchange an OAuth authorization code for a session token.
    ///
    /// # Errors
    ///
    /// As [`AuthGateway::authenticate`].
    pub async fn validate_oauth(&self, code: String) -> Result<AuthenticatedSession, AuthError> {
        if code.trim().is_empty() {
            return Err(AuthError::InvalidRequest("code is required".to_string()));
        }
        self.authenticate(Credentials::AuthorizationCode { code }).await
    }

    async fn verify_and_issue(
        &self,
        credentials: &Credentials,
    ) -> Result<(Identity, Strategy, AuthenticatedSession), AuthError> {
        let strategy = self.verifier.strategy_for(credentials)?;

        let identity = tokio::time::timeout(self.verify_timeout, self.verifier.verify(credentials))
            .await
            .map_err(|_| {
                AuthError::UpstreamUnavailable(format!(
                    "{strategy} verification timed out after {:?}",
                    self.verify_timeout
                ))
            })??;

        let issued = self.codec.issue(&identity, self.session_ttl)?;
        audit::emit(&AuditEvent::login_succeeded(
            &identity.subject_id,
            strategy,
            &issued,
        ));

        Ok((
            identity,
            strategy,
            AuthenticatedSession {
                jwt: issued.token,
                expires_at: issued.expires_at,
            },
        ))
    }

    /// End `session`: its token id is revoked until expiry and the user's
    /// cached upstream credentials are dropped.
    pub fn logout(&self, session: &SessionToken) {
        self.revocations.revoke(&session.token_id, session.expires_at);
        let evicted = self.upstream.evict_user(session.subject_id());
        info!(subject = %session.subject_id(), evicted, "Logged out");
        audit::emit(&AuditEvent::revoked(session));
    }

    /// Change the caller's local password.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] if `current` is wrong
    /// - [`AuthError::WeakPassword`] if `new` fails the strength policy
    pub async fn change_password(
        &self,
        identity: &Identity,
        current: &str,
        new: &str,
    ) -> Result<(), AuthError> {
        match self
            .verifier
            .change_password(&identity.subject_id, current, new)
            .await
        {
            Ok(()) => {
                info!(subject = %identity.subject_id, "Password changed");
                audit::emit(&AuditEvent::password_changed(&identity.subject_id));
                Ok(())
            }
            Err(e) => {
                warn!(subject = %identity.subject_id, error = %e, "Password change rejected");
                audit::emit(&AuditEvent::password_rejected(&identity.subject_id, &e));
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthenticationMethod, UserConfig};
    use crate::identity::Role;
    use crate::verifier::{
        InMemoryUserStore, SsoError, SsoProfile, SsoProvider, UserStore, hash_password,
    };
    use pretty_assertions::assert_eq;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    struct StalledSso;

    #[async_trait::async_trait]
    impl SsoProvider for StalledSso {
        async fn exchange(&self, _code: &str) -> Result<SsoProfile, SsoError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(SsoError::Unavailable("unreachable".to_string()))
        }
    }

    fn gateway(verify_timeout: Duration) -> (AuthGateway, Arc<TokenCodec>) {
        let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::from_config(&[UserConfig {
            username: "alice".to_string(),
            password_hash: Some(hash_password("correct horse battery", 4).unwrap()),
            display_name: None,
            role: Role::User,
            teams: Vec::new(),
        }]));
        let verifier = CredentialVerifier::new(users, AuthenticationMethod::Local, 4)
            .unwrap()
            .with_sso(Arc::new(StalledSso), false, None);
        let codec = Arc::new(TokenCodec::new(SECRET, "authgate"));
        let gateway = AuthGateway::new(
            Arc::new(verifier),
            Arc::clone(&codec),
            Arc::new(RevocationList::new()),
            UpstreamCredentialCache::new(
                Duration::from_secs(60),
                Duration::ZERO,
                Duration::from_secs(1),
            ),
            Duration::from_secs(3600),
            verify_timeout,
        );
        (gateway, codec)
    }

    #[tokio::test]
    async fn issued_token_verifies_to_the_same_subject() {
        let (gateway, codec) = gateway(Duration::from_secs(5));

        let session = gateway
            .authenticate(Credentials::Password {
                username: "alice".to_string(),
                password: "correct horse battery".to_string(),
            })
            .await
            .unwrap();

        let verified = codec.verify(&session.jwt).unwrap();
        assert_eq!(verified.subject_id(), "alice");
        assert_eq!(verified.expires_at, session.expires_at);
    }

    #[tokio::test]
    async fn slow_provider_is_unavailable_not_invalid() {
        // GIVEN: a provider that never answers within the verify timeout
        let (gateway, _) = gateway(Duration::from_millis(50));

        // WHEN: validating a code
        let result = gateway.validate_oauth("some-code".to_string()).await;

        // THEN: the timeout surfaces as an upstream failure
        assert!(matches!(result, Err(AuthError::UpstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn empty_code_is_rejected_before_the_provider() {
        let (gateway, _) = gateway(Duration::from_secs(5));
        assert!(matches!(
            gateway.validate_oauth("  ".to_string()).await,
            Err(AuthError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn logout_revokes_the_token_id() {
        let (gateway, codec) = gateway(Duration::from_secs(5));
        let session = gateway
            .authenticate(Credentials::Password {
                username: "alice".to_string(),
                password: "correct horse battery".to_string(),
            })
            .await
            .unwrap();
        let verified = codec.verify(&session.jwt).unwrap();

        gateway.logout(&verified);

        assert!(gateway.revocations.is_revoked(&verified.token_id));
    }
}
