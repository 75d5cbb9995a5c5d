//! Error types for authgate

use std::io;
use std::time::Duration;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Result type alias for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Infrastructure errors (configuration, startup, IO)
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Request-facing failures of the authentication gateway.
///
/// Every variant maps to one HTTP status and one stable, non-leaking message.
/// Details that would help an attacker (which check failed, what the upstream
/// said) are logged where the error is created and never rendered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Bad username/password, bad authorization code or unknown subject.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Too many attempts from one client.
    #[error("Too many attempts, retry in {}s", retry_after_hint(.retry_after))]
    RateLimited {
        /// Time until the client's budget resets.
        retry_after: Duration,
    },

    /// Missing, malformed, expired, forged or revoked session token.
    #[error("Invalid or missing session token")]
    InvalidToken,

    /// Valid identity without the role or team the route requires.
    #[error("Access denied")]
    AuthorizationDenied,

    /// Directory or identity provider unreachable, failing or too slow.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Could not obtain a fresh upstream cluster credential.
    #[error("Unable to obtain upstream credential: {0}")]
    MintFailed(String),

    /// Password rejected by the strength policy.
    #[error("Password does not meet the strength requirements")]
    WeakPassword,

    /// Malformed request payload.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unexpected internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// HTTP status for this error
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidCredentials => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::AuthorizationDenied => StatusCode::FORBIDDEN,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::MintFailed(_) => StatusCode::BAD_GATEWAY,
            Self::WeakPassword | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "invalid_credentials",
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidToken => "invalid_token",
            Self::AuthorizationDenied => "access_denied",
            Self::UpstreamUnavailable(_) => "upstream_unavailable",
            Self::MintFailed(_) => "mint_failed",
            Self::WeakPassword => "weak_password",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show to the caller.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::UpstreamUnavailable(_) => "Authentication provider unavailable".to_string(),
            Self::MintFailed(_) => "Unable to obtain cluster credentials".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

fn retry_after_hint(retry_after: &Duration) -> u64 {
    retry_after_secs(*retry_after)
}

/// Whole seconds for a `Retry-After` hint, never zero.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.code(),
            "message": self.public_message(),
        }));
        let mut response = (self.status(), body).into_response();

        match &self {
            Self::InvalidToken => {
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            }
            Self::RateLimited { retry_after } => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
            }
            _ => {}
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_token_carries_challenge_header() {
        let response = AuthError::InvalidToken.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
    }

    #[test]
    fn rate_limited_rounds_retry_after_up() {
        let response = AuthError::RateLimited {
            retry_after: Duration::from_millis(1500),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");

        let response = AuthError::RateLimited {
            retry_after: Duration::ZERO,
        }
        .into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn upstream_details_are_not_rendered() {
        let err = AuthError::UpstreamUnavailable("ldap.internal:636 refused".to_string());
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.public_message().contains("ldap.internal"));

        let err = AuthError::MintFailed("token request returned 500".to_string());
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        assert!(!err.public_message().contains("500"));
    }

    #[test]
    fn credential_and_permission_failures_are_distinct() {
        assert_ne!(
            AuthError::InvalidCredentials.status(),
            AuthError::RateLimited {
                retry_after: Duration::from_secs(1)
            }
            .status()
        );
        assert_ne!(AuthError::InvalidToken.status(), AuthError::AuthorizationDenied.status());
    }
}
