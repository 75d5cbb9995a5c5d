//! Session token signing and verification.
//!
//! Tokens are HS256 JWTs carrying a snapshot of the caller's identity. The
//! codec holds nothing but keys and a validation profile, so it is shared
//! freely across request tasks without locking.
//!
//! Every verification failure (bad encoding, bad signature, wrong issuer,
//! expiry) collapses into [`AuthError::InvalidToken`]; the underlying reason is
//! only logged at `debug`.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;
use crate::identity::{Identity, Role};

/// Claims embedded in a session token.
#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    /// Subject
    sub: String,
    /// Display name snapshot
    name: String,
    /// Role snapshot
    role: Role,
    /// Team snapshot
    #[serde(default)]
    teams: Vec<String>,
    /// Issuer
    iss: String,
    /// Issued-at (Unix seconds)
    iat: i64,
    /// Expires-at (Unix seconds)
    exp: i64,
    /// Token id, used for revocation
    jti: String,
}

/// A verified session token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionToken {
    /// Unique token id.
    pub token_id: String,
    /// When the token was issued.
    pub issued_at: DateTime<Utc>,
    /// When the token stops being valid.
    pub expires_at: DateTime<Utc>,
    /// Identity snapshot taken at issuance.
    pub identity: Identity,
}

impl SessionToken {
    /// Subject the token was issued to.
    #[must_use]
    pub fn subject_id(&self) -> &str {
        &self.identity.subject_id
    }
}

/// Freshly signed token returned by [`TokenCodec::issue`].
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Compact JWT.
    pub token: String,
    /// Token id.
    pub token_id: String,
    /// Expiry.
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies session tokens.
pub struct TokenCodec {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
}

impl TokenCodec {
    /// Create a codec for `secret`, stamping tokens with `issuer`.
    #[must_use]
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "sub", "iss"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer,
        }
    }

    /// Issue a token for `identity` valid for `ttl` from now.
    pub fn issue(&self, identity: &Identity, ttl: Duration) -> Result<IssuedToken, AuthError> {
        self.issue_at(identity, Utc::now(), ttl)
    }

    /// Issue a token as if the current time were `issued_at`.
    pub fn issue_at(
        &self,
        identity: &Identity,
        issued_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<IssuedToken, AuthError> {
        let iat = issued_at.timestamp();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let exp = iat.saturating_add(ttl_secs);
        let token_id = uuid::Uuid::new_v4().to_string();

        let claims = SessionClaims {
            sub: identity.subject_id.clone(),
            name: identity.display_name.clone(),
            role: identity.role,
            teams: identity.teams.clone(),
            iss: self.issuer.clone(),
            iat,
            exp,
            jti: token_id.clone(),
        };

        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Internal(format!("failed to sign session token: {e}")))?;

        Ok(IssuedToken {
            token,
            token_id,
            expires_at: timestamp(exp)?,
        })
    }

    /// Verify a compact token and return its contents.
    pub fn verify(&self, token: &str) -> Result<SessionToken, AuthError> {
        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                debug!(error = %e, "Session token rejected");
                AuthError::InvalidToken
            })?;
        let claims = data.claims;

        // The library accepts exp == now; a session is valid only while now < exp.
        if Utc::now().timestamp() >= claims.exp {
            debug!(subject = %claims.sub, "Session token expired");
            return Err(AuthError::InvalidToken);
        }

        Ok(SessionToken {
            token_id: claims.jti,
            issued_at: timestamp(claims.iat).map_err(|_| AuthError::InvalidToken)?,
            expires_at: timestamp(claims.exp).map_err(|_| AuthError::InvalidToken)?,
            identity: Identity {
                subject_id: claims.sub,
                display_name: claims.name,
                role: claims.role,
                teams: claims.teams,
            },
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, AuthError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| AuthError::Internal(format!("timestamp out of range: {secs}")))
}
