//! User records known to the gateway.
//!
//! Persistent storage is owned by the management backend; the gateway only
//! needs lookups, first-login provisioning and password updates. The
//! in-memory store is seeded from configuration.

use dashmap::DashMap;
use serde::Serialize;

use crate::config::UserConfig;
use crate::identity::{Identity, Role};

/// A user record.
#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    /// Username (subject id)
    pub username: String,
    /// Display name
    pub display_name: String,
    /// bcrypt hash; `None` for accounts that only log in externally
    #[serde(skip)]
    pub password_hash: Option<String>,
    /// Role
    pub role: Role,
    /// Team memberships
    pub teams: Vec<String>,
}

impl UserRecord {
    /// A record for an externally authenticated user on first login.
    #[must_use]
    pub fn provisioned(username: &str, display_name: Option<String>, teams: Vec<String>) -> Self {
        Self {
            username: username.to_string(),
            display_name: display_name.unwrap_or_else(|| username.to_string()),
            password_hash: None,
            role: Role::User,
            teams,
        }
    }

    /// Identity resolved from this record.
    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity {
            subject_id: self.username.clone(),
            display_name: self.display_name.clone(),
            role: self.role,
            teams: self.teams.clone(),
        }
    }
}

impl From<&UserConfig> for UserRecord {
    fn from(config: &UserConfig) -> Self {
        Self {
            username: config.username.clone(),
            display_name: config
                .display_name
                .clone()
                .unwrap_or_else(|| config.username.clone()),
            password_hash: config.password_hash.clone(),
            role: config.role,
            teams: config.teams.clone(),
        }
    }
}

/// Trait abstracting the user record backend.
#[async_trait::async_trait]
pub trait UserStore: Send + Sync + 'static {
    /// Look up a user by username.
    async fn find(&self, username: &str) -> Option<UserRecord>;

    /// Insert a user unless the username is taken. Returns the stored record.
    async fn insert_if_absent(&self, record: UserRecord) -> UserRecord;

    /// Replace a user's password hash. Returns `false` for unknown users.
    async fn set_password_hash(&self, username: &str, hash: String) -> bool;

    /// All known users.
    async fn list(&self) -> Vec<UserRecord>;
}

/// In-memory user store backed by a `DashMap`.
#[derive(Default)]
pub struct InMemoryUserStore {
    users: DashMap<String, UserRecord>,
}

impl InMemoryUserStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded from configured accounts.
    #[must_use]
    pub fn from_config(users: &[UserConfig]) -> Self {
        let store = Self::new();
        for user in users {
            store.users.insert(user.username.clone(), UserRecord::from(user));
        }
        store
    }
}

#[async_trait::async_trait]
impl UserStore for InMemoryUserStore {
    async fn find(&self, username: &str) -> Option<UserRecord> {
        self.users.get(username).map(|entry| entry.value().clone())
    }

    async fn insert_if_absent(&self, record: UserRecord) -> UserRecord {
        self.users
            .entry(record.username.clone())
            .or_insert(record)
            .value()
            .clone()
    }

    async fn set_password_hash(&self, username: &str, hash: String) -> bool {
        match self.users.get_mut(username) {
            Some(mut entry) => {
                entry.password_hash = Some(hash);
                true
            }
            None => false,
        }
    }

    async fn list(&self) -> Vec<UserRecord> {
        let mut users: Vec<UserRecord> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }
}
