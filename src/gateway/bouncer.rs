//! Per-route access enforcement.
//!
//! Every route is wired with an [`AccessPolicy`]. For anything but `Public`
//! the bouncer requires `Authorization: Bearer <token>`, verifies the token,
//! rejects revoked sessions, applies the optional per-subject quota and checks
//! the policy. Handlers only ever run with a verified [`Identity`] and
//! [`SessionToken`] in the request extensions.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::gateway::audit::{self, AuditEvent};
use crate::identity::{AccessPolicy, Identity};
use crate::token::{RevocationList, SessionToken, TokenCodec};

/// Keyed GCRA limiter for authenticated traffic
type SubjectQuota = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Verifies session tokens and enforces access policies.
pub struct Bouncer {
    codec: Arc<TokenCodec>,
    revocations: Arc<RevocationList>,
    quota: Option<SubjectQuota>,
}

impl Bouncer {
    /// Create a bouncer without a per-subject quota.
    #[must_use]
    pub fn new(codec: Arc<TokenCodec>, revocations: Arc<RevocationList>) -> Self {
        Self {
            codec,
            revocations,
            quota: None,
        }
    }

    /// Limit each subject to `requests_per_minute` (0 = unlimited).
    #[must_use]
    pub fn with_quota(mut self, requests_per_minute: u32) -> Self {
        self.quota = NonZeroU32::new(requests_per_minute)
            .map(|rpm| RateLimiter::keyed(Quota::per_minute(rpm)));
        self
    }

    /// Verify the bearer token in `headers`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidToken`] for a missing, invalid, expired or revoked token
    /// - [`AuthError::RateLimited`] when the subject exceeded its quota
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<SessionToken, AuthError> {
        let token = bearer_token(headers).ok_or_else(|| {
            debug!("Missing bearer token");
            AuthError::InvalidToken
        })?;

        let session = self.codec.verify(token)?;

        if self.revocations.is_revoked(&session.token_id) {
            debug!(subject = %session.subject_id(), "Revoked session token presented");
            return Err(AuthError::InvalidToken);
        }

        if let Some(quota) = &self.quota {
            let subject = session.subject_id().to_string();
            if let Err(not_until) = quota.check_key(&subject) {
                let retry_after = not_until.wait_time_from(DefaultClock::default().now());
                warn!(subject = %subject, "Per-subject quota exceeded");
                return Err(AuthError::RateLimited { retry_after });
            }
        }

        Ok(session)
    }

    /// Decide a request for `path` under `policy`. `Ok(None)` means a public
    /// route. Denials are written to the audit log.
    ///
    /// # Errors
    ///
    /// As [`Bouncer::authenticate`], plus [`AuthError::AuthorizationDenied`]
    /// when the identity falls outside the policy.
    pub fn authorize(
        &self,
        policy: &AccessPolicy,
        headers: &HeaderMap,
        path: &str,
    ) -> Result<Option<SessionToken>, AuthError> {
        if !policy.requires_session() {
            return Ok(None);
        }

        let session = self.authenticate(headers)?;
        if !policy.permits(&session.identity) {
            warn!(subject = %session.subject_id(), path = %path, "Access denied by route policy");
            audit::emit(&AuditEvent::access_denied(session.subject_id(), path));
            return Err(AuthError::AuthorizationDenied);
        }
        Ok(Some(session))
    }

    /// Forget subjects whose quota has fully replenished.
    pub fn prune_quota(&self) {
        if let Some(quota) = &self.quota {
            quota.retain_recent();
        }
    }

    /// Subjects currently tracked by the quota.
    #[must_use]
    pub fn tracked_subjects(&self) -> usize {
        self.quota.as_ref().map_or(0, |quota| quota.len())
    }

    /// Whether a per-subject quota is configured.
    #[must_use]
    pub fn has_quota(&self) -> bool {
        self.quota.is_some()
    }

    /// Guard for routes wired with `policy`.
    #[must_use]
    pub fn guard(self: &Arc<Self>, policy: AccessPolicy) -> Guard {
        Guard {
            bouncer: Arc::clone(self),
            policy: Arc::new(policy),
        }
    }
}

/// Token from an `Authorization: Bearer` header. The scheme is matched
/// case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Middleware state: a bouncer plus the policy of the routes it guards.
#[derive(Clone)]
pub struct Guard {
    bouncer: Arc<Bouncer>,
    policy: Arc<AccessPolicy>,
}

/// Access enforcement middleware.
pub async fn bounce(State(guard): State<Guard>, mut request: Request<Body>, next: Next) -> Response {
    let decision = guard
        .bouncer
        .authorize(&guard.policy, request.headers(), request.uri().path());

    match decision {
        Ok(None) => next.run(request).await,
        Ok(Some(session)) => {
            debug!(subject = %session.subject_id(), path = %request.uri().path(), "Authenticated request");
            request.extensions_mut().insert::<Identity>(session.identity.clone());
            request.extensions_mut().insert(session);
            next.run(request).await
        }
        Err(e) => e.into_response(),
    }
}

/// Periodically prune the per-subject quota until shutdown.
pub fn spawn_quota_sweeper(
    bouncer: Arc<Bouncer>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    bouncer.prune_quota();
                    debug!(tracked = bouncer.tracked_subjects(), "Pruned subject quota");
                }
                _ = shutdown_rx.recv() => {
                    debug!("Subject quota sweeper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use axum::{Extension, Router, http::HeaderValue, http::StatusCode, middleware, routing::get};
    use tower::ServiceExt;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn identity(role: Role) -> Identity {
        Identity {
            subject_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            role,
            teams: vec!["dev".to_string()],
        }
    }

    fn bouncer() -> (Bouncer, Arc<TokenCodec>, Arc<RevocationList>) {
        let codec = Arc::new(TokenCodec::new(SECRET, "authgate"));
        let revocations = Arc::new(RevocationList::new());
        (
            Bouncer::new(Arc::clone(&codec), Arc::clone(&revocations)),
            codec,
            revocations,
        )
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token(&headers_with("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers_with("bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers_with("BEARER abc")), Some("abc"));
        assert_eq!(bearer_token(&headers_with("Basic abc")), None);
        assert_eq!(bearer_token(&headers_with("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn public_policy_needs_no_token() {
        let (bouncer, _, _) = bouncer();
        assert_eq!(bouncer.authorize(&AccessPolicy::Public, &HeaderMap::new(), "/health"), Ok(None));
    }

    #[test]
    fn missing_or_forged_token_is_invalid() {
        let (bouncer, _, _) = bouncer();
        assert_eq!(
            bouncer.authorize(&AccessPolicy::Authenticated, &HeaderMap::new(), "/users/me"),
            Err(AuthError::InvalidToken)
        );
        assert_eq!(
            bouncer.authorize(
                &AccessPolicy::Authenticated,
                &headers_with("Bearer not.a.jwt"),
                "/users/me"
            ),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn non_admin_on_admin_route_is_denied_not_invalid() {
        // GIVEN: a valid session for a standard user
        let (bouncer, codec, _) = bouncer();
        let issued = codec.issue(&identity(Role::User), Duration::from_secs(60)).unwrap();
        let headers = headers_with(&format!("Bearer {}", issued.token));

        // WHEN: hitting an admin-only route
        let result = bouncer.authorize(&AccessPolicy::admin_only(), &headers, "/users");

        // THEN: the token is fine, the role is not
        assert_eq!(result, Err(AuthError::AuthorizationDenied));
    }

    #[test]
    fn team_policy_admits_members() {
        let (bouncer, codec, _) = bouncer();
        let issued = codec.issue(&identity(Role::User), Duration::from_secs(60)).unwrap();
        let headers = headers_with(&format!("Bearer {}", issued.token));

        let session = bouncer
            .authorize(&AccessPolicy::teams(["dev", "ops"]), &headers, "/deploy")
            .unwrap()
            .unwrap();
        assert_eq!(session.subject_id(), "alice");
        assert_eq!(
            bouncer.authorize(&AccessPolicy::teams(["finance"]), &headers, "/ledger"),
            Err(AuthError::AuthorizationDenied)
        );
    }

    #[test]
    fn revoked_token_is_invalid() {
        let (bouncer, codec, revocations) = bouncer();
        let issued = codec.issue(&identity(Role::Admin), Duration::from_secs(60)).unwrap();
        let headers = headers_with(&format!("Bearer {}", issued.token));
        assert!(bouncer.authenticate(&headers).is_ok());

        revocations.revoke(&issued.token_id, issued.expires_at);

        assert_eq!(bouncer.authenticate(&headers), Err(AuthError::InvalidToken));
    }

    #[test]
    fn subject_quota_rate_limits() {
        let (bouncer, codec, _) = bouncer();
        let bouncer = bouncer.with_quota(2);
        let issued = codec.issue(&identity(Role::User), Duration::from_secs(60)).unwrap();
        let headers = headers_with(&format!("Bearer {}", issued.token));

        assert!(bouncer.authenticate(&headers).is_ok());
        assert!(bouncer.authenticate(&headers).is_ok());
        assert!(matches!(
            bouncer.authenticate(&headers),
            Err(AuthError::RateLimited { .. })
        ));
    }

    #[test]
    fn quota_prune_forgets_replenished_subjects() {
        // GIVEN: a fast-replenishing quota that has seen alice
        let (bouncer, codec, _) = bouncer();
        let bouncer = bouncer.with_quota(6000);
        let issued = codec.issue(&identity(Role::User), Duration::from_secs(60)).unwrap();
        bouncer
            .authenticate(&headers_with(&format!("Bearer {}", issued.token)))
            .unwrap();
        assert_eq!(bouncer.tracked_subjects(), 1);

        // WHEN: her quota has fully replenished and the sweeper runs
        std::thread::sleep(Duration::from_millis(100));
        bouncer.prune_quota();

        // THEN: she is no longer tracked
        assert_eq!(bouncer.tracked_subjects(), 0);
    }

    #[test]
    fn prune_without_quota_is_a_no_op() {
        let (bouncer, _, _) = bouncer();
        bouncer.prune_quota();
        assert!(!bouncer.has_quota());
        assert_eq!(bouncer.tracked_subjects(), 0);
    }

    async fn whoami(Extension(identity): Extension<Identity>) -> String {
        identity.subject_id
    }

    fn guarded(bouncer: &Arc<Bouncer>, policy: AccessPolicy) -> Router {
        Router::new()
            .route("/whoami", get(whoami))
            .route_layer(middleware::from_fn_with_state(bouncer.guard(policy), bounce))
    }

    fn whoami_request(token: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/whoami");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn middleware_enforces_team_policy() {
        // GIVEN: a route restricted to the dev team and one to finance
        let (bouncer, codec, _) = bouncer();
        let bouncer = Arc::new(bouncer);
        let issued = codec.issue(&identity(Role::User), Duration::from_secs(60)).unwrap();

        // WHEN: alice (dev) calls both
        let dev = guarded(&bouncer, AccessPolicy::teams(["dev"]))
            .oneshot(whoami_request(Some(&issued.token)))
            .await
            .unwrap();
        let finance = guarded(&bouncer, AccessPolicy::teams(["finance"]))
            .oneshot(whoami_request(Some(&issued.token)))
            .await
            .unwrap();

        // THEN: the handler sees her identity on one, the other is forbidden
        assert_eq!(dev.status(), StatusCode::OK);
        let body = axum::body::to_bytes(dev.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"alice");
        assert_eq!(finance.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn middleware_tells_denied_from_invalid() {
        let (bouncer, codec, _) = bouncer();
        let bouncer = Arc::new(bouncer);
        let issued = codec.issue(&identity(Role::User), Duration::from_secs(60)).unwrap();
        let app = guarded(&bouncer, AccessPolicy::admin_only());

        let denied = app
            .clone()
            .oneshot(whoami_request(Some(&issued.token)))
            .await
            .unwrap();
        let missing = app.clone().oneshot(whoami_request(None)).await.unwrap();
        let forged = app.oneshot(whoami_request(Some("not.a.jwt"))).await.unwrap();

        assert_eq!(denied.status(), StatusCode::FORBIDDEN);
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn middleware_passes_public_routes_through() {
        let (bouncer, _, _) = bouncer();
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route_layer(middleware::from_fn_with_state(
                Arc::new(bouncer).guard(AccessPolicy::Public),
                bounce,
            ));

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
