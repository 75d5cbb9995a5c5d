//! Minting per-user credentials on remote clusters.
//!
//! Each user maps to a service account in a gateway-owned namespace on every
//! cluster. A credential is a short-lived token requested for that account
//! through the Kubernetes `TokenRequest` API. The reverse proxy never mints
//! directly; it asks the [`ClusterCredentialBroker`], which goes through the
//! cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::cache::{UpstreamCredential, UpstreamCredentialCache};
use crate::config::{ClusterConfig, UpstreamConfig};
use crate::error::AuthError;

/// Shortest lifetime the `TokenRequest` API accepts
const MIN_TOKEN_LIFETIME: Duration = Duration::from_secs(600);

/// Mint failures.
#[derive(Debug, thiserror::Error)]
pub enum MintError {
    /// No cluster with this id is configured.
    #[error("unknown cluster '{0}'")]
    UnknownCluster(String),

    /// The cluster API could not be reached.
    #[error("cluster API request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The cluster API refused the token request.
    #[error("cluster API returned HTTP {status}: {body}")]
    Rejected {
        /// HTTP status
        status: u16,
        /// Response body (truncated)
        body: String,
    },
}

/// A cluster-side credential issuer.
#[async_trait::async_trait]
pub trait ClusterTokenMinter: Send + Sync + 'static {
    /// Mint a fresh credential impersonating `user_id` on `cluster_id`.
    async fn mint(&self, user_id: &str, cluster_id: &str) -> Result<UpstreamCredential, MintError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequestStatus {
    token: String,
    expiration_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenRequestResponse {
    status: TokenRequestStatus,
}

/// Mints service-account tokens through the Kubernetes `TokenRequest` API.
pub struct KubernetesTokenMinter {
    http: Client,
    clusters: HashMap<String, ClusterConfig>,
}

impl KubernetesTokenMinter {
    /// Create a minter for the configured clusters.
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(config.mint_timeout).build()?;
        Ok(Self {
            http,
            clusters: config.clusters.clone(),
        })
    }

    fn token_request_url(cluster: &ClusterConfig, user_id: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/serviceaccounts/{}{}/token",
            cluster.api_url.trim_end_matches('/'),
            cluster.namespace,
            cluster.service_account_prefix,
            user_id
        )
    }
}

#[async_trait::async_trait]
impl ClusterTokenMinter for KubernetesTokenMinter {
    async fn mint(&self, user_id: &str, cluster_id: &str) -> Result<UpstreamCredential, MintError> {
        let cluster = self
            .clusters
            .get(cluster_id)
            .ok_or_else(|| MintError::UnknownCluster(cluster_id.to_string()))?;

        let body = json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenRequest",
            "spec": {
                "expirationSeconds": cluster.token_lifetime.max(MIN_TOKEN_LIFETIME).as_secs(),
            }
        });

        let mut request = self
            .http
            .post(Self::token_request_url(cluster, user_id))
            .json(&body);
        if let Some(token) = cluster.resolve_bearer_token() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MintError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: TokenRequestResponse = response.json().await?;
        debug!(user = %user_id, cluster = %cluster_id, expires_at = %parsed.status.expiration_timestamp, "Minted service account token");
        Ok(UpstreamCredential {
            token: parsed.status.token,
            expires_at: parsed.status.expiration_timestamp,
        })
    }
}

/// Hands out upstream credentials to the reverse proxy.
#[derive(Clone)]
pub struct ClusterCredentialBroker {
    cache: UpstreamCredentialCache,
    minter: Arc<dyn ClusterTokenMinter>,
}

impl ClusterCredentialBroker {
    /// Create a broker minting through `minter` and caching in `cache`.
    #[must_use]
    pub fn new(cache: UpstreamCredentialCache, minter: Arc<dyn ClusterTokenMinter>) -> Self {
        Self { cache, minter }
    }

    /// Credential for `user_id` on `cluster_id`, cached or freshly minted.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MintFailed`] if no credential can be obtained.
    pub async fn credential_for(
        &self,
        user_id: &str,
        cluster_id: &str,
    ) -> Result<UpstreamCredential, AuthError> {
        let minter = Arc::clone(&self.minter);
        let (user, cluster) = (user_id.to_string(), cluster_id.to_string());
        self.cache
            .get(user_id, cluster_id, move || async move {
                minter.mint(&user, &cluster).await
            })
            .await
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &UpstreamCredentialCache {
        &self.cache
    }
}
