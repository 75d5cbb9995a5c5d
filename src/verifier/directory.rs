//! Directory-server bind.
//!
//! The gateway never speaks the directory protocol itself; it calls a bind
//! endpoint that answers `200` with the entry on success and `401`/`403` when
//! the directory refuses the credentials. Anything else, including transport
//! errors and timeouts, means the directory is unavailable.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::DirectoryConfig;
use crate::error::AuthError;

/// Directory entry returned by a successful bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    /// Canonical username
    pub username: String,
    /// Display name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Group memberships
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Directory bind failures.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The directory refused the credentials.
    #[error("bind rejected")]
    Rejected,

    /// The directory could not be reached or answered unexpectedly.
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

impl From<DirectoryError> for AuthError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Rejected => AuthError::InvalidCredentials,
            DirectoryError::Unavailable(detail) => AuthError::UpstreamUnavailable(detail),
        }
    }
}

/// A directory service able to verify a username/password pair.
#[async_trait::async_trait]
pub trait DirectoryService: Send + Sync + 'static {
    /// Bind as `username` with `password`.
    async fn bind(&self, username: &str, password: &str) -> Result<DirectoryEntry, DirectoryError>;
}

#[derive(Serialize)]
struct BindRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Directory reached over HTTP.
pub struct HttpDirectory {
    http: Client,
    bind_url: String,
}

impl HttpDirectory {
    /// Create from configuration.
    pub fn new(config: &DirectoryConfig) -> Result<Self, reqwest::Error> {
        Self::with_timeout(&config.url, config.timeout)
    }

    /// Create for `base_url` with a per-request timeout.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            bind_url: format!("{}/bind", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait::async_trait]
impl DirectoryService for HttpDirectory {
    async fn bind(&self, username: &str, password: &str) -> Result<DirectoryEntry, DirectoryError> {
        let response = self
            .http
            .post(&self.bind_url)
            .json(&BindRequest { username, password })
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Directory bind request failed");
                DirectoryError::Unavailable(e.to_string())
            })?;

        match response.status() {
            status if status.is_success() => response.json::<DirectoryEntry>().await.map_err(|e| {
                warn!(error = %e, "Malformed directory bind response");
                DirectoryError::Unavailable(format!("malformed bind response: {e}"))
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                debug!(username = %username, "Directory rejected bind");
                Err(DirectoryError::Rejected)
            }
            status => {
                warn!(status = %status, "Directory bind returned unexpected status");
                Err(DirectoryError::Unavailable(format!("bind returned HTTP {status}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_onto_the_gateway_taxonomy() {
        assert_eq!(
            AuthError::from(DirectoryError::Rejected),
            AuthError::InvalidCredentials
        );
        assert!(matches!(
            AuthError::from(DirectoryError::Unavailable("timeout".to_string())),
            AuthError::UpstreamUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn unreachable_directory_is_unavailable_not_rejected() {
        // GIVEN: a directory URL nobody listens on
        let directory =
            HttpDirectory::with_timeout("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();

        // WHEN: binding
        let result = directory.bind("alice", "secret").await;

        // THEN: it is an availability problem, never a credential problem
        assert!(matches!(result, Err(DirectoryError::Unavailable(_))));
    }
}
