//! Single sign-on via an OAuth 2.0 authorization-code exchange.
//!
//! 1. `POST` the code to the provider's token endpoint.
//! 2. `GET` the profile from the resource endpoint with the access token.
//! 3. Read the configured user-identifier field from the profile.
//!
//! A 400 answer from the token endpoint (`invalid_grant`) means the code is
//! bad or expired. Everything else that goes wrong, including 401
//! `invalid_client` and 429, is the provider's problem.

use std::collections::HashMap;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::OAuthProviderConfig;
use crate::error::AuthError;

/// Profile obtained from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoProfile {
    /// Username read from the configured identifier field
    pub username: String,
    /// Display name, when the provider supplies one
    pub display_name: Option<String>,
}

/// SSO failures.
#[derive(Debug, thiserror::Error)]
pub enum SsoError {
    /// The authorization code was rejected (malformed, expired, reused).
    #[error("authorization code rejected")]
    InvalidCode,

    /// The provider failed or answered unexpectedly.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl From<SsoError> for AuthError {
    fn from(err: SsoError) -> Self {
        match err {
            SsoError::InvalidCode => AuthError::InvalidCredentials,
            SsoError::Unavailable(detail) => AuthError::UpstreamUnavailable(detail),
        }
    }
}

/// An external identity provider.
#[async_trait::async_trait]
pub trait SsoProvider: Send + Sync + 'static {
    /// Exchange an authorization code for the caller's profile.
    async fn exchange(&self, code: &str) -> Result<SsoProfile, SsoError>;
}

/// OAuth token response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// OAuth 2.0 authorization-code client.
pub struct OAuthProvider {
    http: Client,
    config: OAuthProviderConfig,
}

impl OAuthProvider {
    /// Create from configuration.
    pub fn new(config: OAuthProviderConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    async fn access_token(&self, code: &str) -> Result<String, SsoError> {
        let mut params = HashMap::new();
        params.insert("grant_type", "authorization_code");
        params.insert("code", code);
        params.insert("redirect_uri", self.config.redirect_uri.as_str());
        params.insert("client_id", self.config.client_id.as_str());
        params.insert("client_secret", self.config.client_secret.as_str());

        let response = self
            .http
            .post(&self.config.access_token_uri)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| SsoError::Unavailable(format!("token request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::BAD_REQUEST {
            debug!(status = %status, "Token endpoint rejected authorization code");
            return Err(SsoError::InvalidCode);
        }
        if !status.is_success() {
            warn!(status = %status, "Token endpoint refused the exchange");
            return Err(SsoError::Unavailable(format!(
                "token exchange failed: HTTP {status}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SsoError::Unavailable(format!("failed to parse token response: {e}")))?;
        Ok(token.access_token)
    }

    async fn profile(&self, access_token: &str) -> Result<Value, SsoError> {
        let response = self
            .http
            .get(&self.config.resource_uri)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| SsoError::Unavailable(format!("profile request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SsoError::Unavailable(format!(
                "profile request failed: HTTP {status}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| SsoError::Unavailable(format!("failed to parse profile: {e}")))
    }
}

#[async_trait::async_trait]
impl SsoProvider for OAuthProvider {
    async fn exchange(&self, code: &str) -> Result<SsoProfile, SsoError> {
        let access_token = self.access_token(code).await?;
        let profile = self.profile(&access_token).await?;

        let Some(username) = profile_field(&profile, &self.config.user_identifier) else {
            warn!(field = %self.config.user_identifier, "User identifier missing from profile");
            return Err(SsoError::Unavailable(format!(
                "profile has no '{}' field",
                self.config.user_identifier
            )));
        };

        let display_name = self
            .config
            .display_name_field
            .as_deref()
            .and_then(|field| profile_field(&profile, field));

        Ok(SsoProfile {
            username,
            display_name,
        })
    }
}

/// Read a string or numeric field from a profile document.
fn profile_field(profile: &Value, field: &str) -> Option<String> {
    match profile.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profile_field_accepts_strings_and_numbers() {
        let profile = json!({"email": "alice@example.com", "id": 42, "name": "", "groups": []});
        assert_eq!(profile_field(&profile, "email").as_deref(), Some("alice@example.com"));
        assert_eq!(profile_field(&profile, "id").as_deref(), Some("42"));
        assert_eq!(profile_field(&profile, "name"), None);
        assert_eq!(profile_field(&profile, "groups"), None);
        assert_eq!(profile_field(&profile, "missing"), None);
    }

    #[test]
    fn errors_map_onto_the_gateway_taxonomy() {
        assert_eq!(AuthError::from(SsoError::InvalidCode), AuthError::InvalidCredentials);
        assert!(matches!(
            AuthError::from(SsoError::Unavailable("503".to_string())),
            AuthError::UpstreamUnavailable(_)
        ));
    }
}
