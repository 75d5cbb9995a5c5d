//! Credential verification.
//!
//! A login request carries either a username/password pair or an OAuth
//! authorization code. The shape of the credentials together with the
//! configured authentication method selects one [`Strategy`]:
//!
//! | Credentials         | Method      | Strategy        |
//! |---------------------|-------------|-----------------|
//! | password            | `local`     | `LocalPassword` |
//! | password            | `directory` | `DirectoryBind` (local-only users: `LocalPassword`) |
//! | authorization code  | any         | `SsoExchange`   |
//!
//! Every strategy ends in an [`Identity`] resolved from the user store, or in
//! an [`AuthError`]. Wrong passwords and unknown users are indistinguishable.

pub mod directory;
pub mod sso;
pub mod store;
pub mod strength;

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{AuthConfig, AuthenticationMethod};
use crate::error::AuthError;
use crate::identity::Identity;
use crate::{Error, Result};

pub use directory::{DirectoryEntry, DirectoryError, DirectoryService, HttpDirectory};
pub use sso::{OAuthProvider, SsoError, SsoProfile, SsoProvider};
pub use store::{InMemoryUserStore, UserRecord, UserStore};
pub use strength::{MinLengthChecker, PasswordStrengthChecker};

/// Credentials presented at login.
#[derive(Clone, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    /// Username and password
    Password {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// OAuth authorization code
    AuthorizationCode {
        /// Code returned by the provider's authorization endpoint
        code: String,
    },
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"[redacted]")
                .finish(),
            Self::AuthorizationCode { .. } => f
                .debug_struct("AuthorizationCode")
                .field("code", &"[redacted]")
                .finish(),
        }
    }
}

/// Verification strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// bcrypt hash in the user store
    LocalPassword,
    /// Bind against the directory service
    DirectoryBind,
    /// OAuth authorization-code exchange
    SsoExchange,
}

impl Strategy {
    /// Name used in logs and audit records.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LocalPassword => "local",
            Self::DirectoryBind => "directory",
            Self::SsoExchange => "sso",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct DirectoryStrategy {
    service: Arc<dyn DirectoryService>,
    auto_create_users: bool,
}

struct SsoStrategy {
    provider: Arc<dyn SsoProvider>,
    auto_create_users: bool,
    default_team: Option<String>,
}

/// Hash `password` with bcrypt at `cost`.
///
/// # Errors
///
/// Returns [`Error::Internal`] if bcrypt rejects the cost.
pub fn hash_password(password: &str, cost: u32) -> Result<String> {
    bcrypt::hash(password, cost).map_err(|e| Error::Internal(format!("bcrypt: {e}")))
}

/// Verifies credentials and resolves identities.
pub struct CredentialVerifier {
    users: Arc<dyn UserStore>,
    method: AuthenticationMethod,
    local_only_users: HashSet<String>,
    directory: Option<DirectoryStrategy>,
    sso: Option<SsoStrategy>,
    strength: Arc<dyn PasswordStrengthChecker>,
    hash_cost: u32,
    /// Compared against for unknown users
    dummy_hash: Arc<str>,
}

impl CredentialVerifier {
    /// Create a verifier for `method` over `users`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if `hash_cost` is not a valid bcrypt cost.
    pub fn new(
        users: Arc<dyn UserStore>,
        method: AuthenticationMethod,
        hash_cost: u32,
    ) -> Result<Self> {
        let dummy_hash = hash_password(&uuid::Uuid::new_v4().to_string(), hash_cost)?;
        Ok(Self {
            users,
            method,
            local_only_users: HashSet::new(),
            directory: None,
            sso: None,
            strength: Arc::new(MinLengthChecker::new(12)),
            hash_cost,
            dummy_hash: dummy_hash.into(),
        })
    }

    /// Build the verifier described by `config`, including the HTTP
    /// directory and OAuth clients when configured.
    ///
    /// # Errors
    ///
    /// Returns an error if an HTTP client cannot be built or the hash cost is
    /// invalid.
    pub fn from_config(config: &AuthConfig, users: Arc<dyn UserStore>) -> Result<Self> {
        let mut verifier = Self::new(users, config.method, config.hash_cost)?
            .with_local_only_users(config.local_only_users.iter().cloned())
            .with_strength_checker(Arc::new(MinLengthChecker::new(
                config.password_policy.min_length,
            )));

        if let Some(directory) = &config.directory {
            verifier = verifier.with_directory(
                Arc::new(HttpDirectory::new(directory)?),
                directory.auto_create_users,
            );
        }
        if let Some(oauth) = &config.oauth {
            verifier = verifier.with_sso(
                Arc::new(OAuthProvider::new(oauth.clone())?),
                oauth.auto_create_users,
                oauth.default_team.clone(),
            );
        }
        Ok(verifier)
    }

    /// Usernames that always authenticate locally.
    #[must_use]
    pub fn with_local_only_users<I>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.local_only_users = users.into_iter().collect();
        self
    }

    /// Attach a directory service.
    #[must_use]
    pub fn with_directory(
        mut self,
        service: Arc<dyn DirectoryService>,
        auto_create_users: bool,
    ) -> Self {
        self.directory = Some(DirectoryStrategy {
            service,
            auto_create_users,
        });
        self
    }

    /// Attach an SSO provider.
    #[must_use]
    pub fn with_sso(
        mut self,
        provider: Arc<dyn SsoProvider>,
        auto_create_users: bool,
        default_team: Option<String>,
    ) -> Self {
        self.sso = Some(SsoStrategy {
            provider,
            auto_create_users,
            default_team,
        });
        self
    }

    /// Replace the password strength policy.
    #[must_use]
    pub fn with_strength_checker(mut self, checker: Arc<dyn PasswordStrengthChecker>) -> Self {
        self.strength = checker;
        self
    }

    /// User store backing this verifier.
    #[must_use]
    pub fn users(&self) -> &Arc<dyn UserStore> {
        &self.users
    }

    /// Select the strategy for `credentials`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidRequest`] when the required strategy is not
    /// configured.
    pub fn strategy_for(&self, credentials: &Credentials) -> std::result::Result<Strategy, AuthError> {
        match credentials {
            Credentials::Password { username, .. } => {
                if self.method == AuthenticationMethod::Directory
                    && !self.local_only_users.contains(username)
                {
                    if self.directory.is_none() {
                        return Err(AuthError::InvalidRequest(
                            "directory authentication is not configured".to_string(),
                        ));
                    }
                    Ok(Strategy::DirectoryBind)
                } else {
                    Ok(Strategy::LocalPassword)
                }
            }
            Credentials::AuthorizationCode { .. } => {
                if self.sso.is_none() {
                    return Err(AuthError::InvalidRequest(
                        "OAuth authentication is not configured".to_string(),
                    ));
                }
                Ok(Strategy::SsoExchange)
            }
        }
    }

    /// Verify `credentials` and resolve the caller's identity.
    ///
    /// # Errors
    ///
    /// - [`AuthError::InvalidCredentials`] for rejected credentials
    /// - [`AuthError::UpstreamUnavailable`] when the directory or provider fails
    /// - [`AuthError::InvalidRequest`] when the required strategy is not configured
    pub async fn verify(&self, credentials: &Credentials) -> std::result::Result<Identity, AuthError> {
        let strategy = self.strategy_for(credentials)?;
        debug!(strategy = %strategy, "Verifying credentials");

        match credentials {
            Credentials::Password { username, password } => match strategy {
                Strategy::DirectoryBind => self.verify_directory(username, password).await,
                _ => self.verify_local(username, password).await,
            },
            Credentials::AuthorizationCode { code } => self.verify_sso(code).await,
        }
    }

    async fn verify_local(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<Identity, AuthError> {
        let record = self.users.find(username).await;
        let hash = record
            .as_ref()
            .and_then(|r| r.password_hash.clone())
            .map_or_else(|| Arc::clone(&self.dummy_hash), Arc::from);

        let matched = bcrypt_verify(password.to_string(), hash).await?;

        match record {
            Some(record) if matched && record.password_hash.is_some() => Ok(record.identity()),
            _ => {
                debug!(subject = %username, "Local password rejected");
                Err(AuthError::InvalidCredentials)
            }
        }
    }

    async fn verify_directory(
        &self,
        username: &str,
        password: &str,
    ) -> std::result::Result<Identity, AuthError> {
        let Some(directory) = &self.directory else {
            return Err(AuthError::InvalidRequest(
                "directory authentication is not configured".to_string(),
            ));
        };

        let entry = directory.service.bind(username, password).await?;

        if let Some(record) = self.users.find(&entry.username).await {
            let mut identity = record.identity();
            let teams: BTreeSet<String> =
                identity.teams.drain(..).chain(entry.groups).collect();
            identity.teams = teams.into_iter().collect();
            return Ok(identity);
        }

        if !directory.auto_create_users {
            info!(subject = %entry.username, "Directory user has no account and auto-create is off");
            return Err(AuthError::InvalidCredentials);
        }

        let record = self
            .users
            .insert_if_absent(UserRecord::provisioned(
                &entry.username,
                entry.display_name,
                entry.groups,
            ))
            .await;
        info!(subject = %record.username, "Provisioned directory user");
        Ok(record.identity())
    }

    async fn verify_sso(&self, code: &str) -> std::result::Result<Identity, AuthError> {
        let Some(sso) = &self.sso else {
            return Err(AuthError::InvalidRequest(
                "OAuth authentication is not configured".to_string(),
            ));
        };

        let profile = sso.provider.exchange(code).await?;

        if let Some(record) = self.users.find(&profile.username).await {
            return Ok(record.identity());
        }

        if !sso.auto_create_users {
            info!(subject = %profile.username, "SSO user has no account and auto-create is off");
            return Err(AuthError::InvalidCredentials);
        }

        let record = self
            .users
            .insert_if_absent(UserRecord::provisioned(
                &profile.username,
                profile.display_name,
                sso.default_team.iter().cloned().collect(),
            ))
            .await;
        info!(subject = %record.username, "Provisioned SSO user");
        Ok(record.identity())
    }

    /// Change a local account's password. The strength policy runs before the
    /// current password is checked.
    ///
    /// # Errors
    ///
    /// - [`AuthError::WeakPassword`] if `new` fails the strength policy
    /// - [`AuthError::InvalidCredentials`] if `current` does not match
    pub async fn change_password(
        &self,
        username: &str,
        current: &str,
        new: &str,
    ) -> std::result::Result<(), AuthError> {
        self.strength.check(new)?;
        self.verify_local(username, current).await?;

        let new = new.to_string();
        let cost = self.hash_cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(new, cost))
            .await
            .map_err(|e| AuthError::Internal(format!("hashing task failed: {e}")))?
            .map_err(|e| AuthError::Internal(format!("bcrypt: {e}")))?;

        if !self.users.set_password_hash(username, hash).await {
            warn!(subject = %username, "User disappeared during password change");
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }
}

/// bcrypt comparison on the blocking pool. A malformed stored hash counts as a
/// mismatch.
async fn bcrypt_verify(password: String, hash: Arc<str>) -> std::result::Result<bool, AuthError> {
    tokio::task::spawn_blocking(move || match bcrypt::verify(password, &hash) {
        Ok(matched) => matched,
        Err(e) => {
            warn!(error = %e, "Stored password hash is unusable");
            false
        }
    })
    .await
    .map_err(|e| AuthError::Internal(format!("verification task failed: {e}")))
}
