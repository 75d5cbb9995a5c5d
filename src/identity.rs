//! Resolved caller identity, roles and per-route access policy.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// User role.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Administrator.
    Admin,
    /// Standard user.
    #[default]
    User,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::User => write!(f, "user"),
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" | "administrator" => Ok(Role::Admin),
            "user" | "standard" => Ok(Role::User),
            _ => Err(format!("unknown role: {s}")),
        }
    }
}

/// A verified caller.
///
/// Produced by the credential verifier at login, snapshotted into the session
/// token, and re-materialised by the bouncer on every request. Never mutated
/// once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable subject identifier (the username).
    pub subject_id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Role at the time the identity was resolved.
    pub role: Role,
    /// Team memberships.
    #[serde(default)]
    pub teams: Vec<String>,
}

impl Identity {
    /// Whether this identity belongs to `team`.
    #[must_use]
    pub fn is_member_of(&self, team: &str) -> bool {
        self.teams.iter().any(|t| t == team)
    }
}

/// Access level a route requires. Fixed at wiring time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessPolicy {
    /// No session required.
    Public,
    /// Any valid session.
    Authenticated,
    /// Valid session whose role is in the set.
    RestrictedRole(BTreeSet<Role>),
    /// Valid session that belongs to at least one of the teams.
    RestrictedTeam(BTreeSet<String>),
}

impl AccessPolicy {
    /// Policy admitting administrators only.
    #[must_use]
    pub fn admin_only() -> Self {
        Self::RestrictedRole(BTreeSet::from([Role::Admin]))
    }

    /// Policy admitting members of any of `teams`.
    #[must_use]
    pub fn teams<I, S>(teams: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::RestrictedTeam(teams.into_iter().map(Into::into).collect())
    }

    /// Whether a request under this policy needs a session token at all.
    #[must_use]
    pub fn requires_session(&self) -> bool {
        !matches!(self, Self::Public)
    }

    /// Whether `identity` satisfies this policy.
    #[must_use]
    pub fn permits(&self, identity: &Identity) -> bool {
        match self {
            Self::Public | Self::Authenticated => true,
            Self::RestrictedRole(roles) => roles.contains(&identity.role),
            Self::RestrictedTeam(teams) => teams.iter().any(|team| identity.is_member_of(team)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(role: Role, teams: &[&str]) -> Identity {
        Identity {
            subject_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            role,
            teams: teams.iter().map(|t| (*t).to_string()).collect(),
        }
    }

    #[test]
    fn role_parses_aliases() {
        assert_eq!("Administrator".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!("user".parse::<Role>().unwrap(), Role::User);
        assert!("root".parse::<Role>().is_err());
    }

    #[test]
    fn admin_only_rejects_standard_users() {
        let policy = AccessPolicy::admin_only();
        assert!(policy.permits(&identity(Role::Admin, &[])));
        assert!(!policy.permits(&identity(Role::User, &["ops"])));
    }

    #[test]
    fn team_policy_matches_any_membership() {
        let policy = AccessPolicy::teams(["ops", "platform"]);
        assert!(policy.permits(&identity(Role::User, &["dev", "platform"])));
        assert!(!policy.permits(&identity(Role::Admin, &["dev"])));
        assert!(!policy.permits(&identity(Role::User, &["platform-ops"])));
    }

    #[test]
    fn only_public_skips_the_session() {
        assert!(!AccessPolicy::Public.requires_session());
        assert!(AccessPolicy::Authenticated.requires_session());
        assert!(AccessPolicy::admin_only().requires_session());
    }
}
