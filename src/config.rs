//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::identity::Role;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Session token configuration
    pub session: SessionConfig,
    /// Login rate limiting
    pub rate_limit: RateLimitConfig,
    /// Credential verification
    pub auth: AuthConfig,
    /// Upstream cluster credential cache
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (AUTHGATE_ prefix)
        figment = figment.merge(Env::prefixed("AUTHGATE_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before env var expansion)
        config.load_env_files();
        config.expand_env_vars()?;
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in secrets and URLs
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;

        if let Some(secret) = self.session.secret.as_mut() {
            *secret = Self::expand_string(&re, secret);
        }
        if let Some(directory) = self.auth.directory.as_mut() {
            directory.url = Self::expand_string(&re, &directory.url);
        }
        if let Some(oauth) = self.auth.oauth.as_mut() {
            for value in [
                &mut oauth.client_secret,
                &mut oauth.access_token_uri,
                &mut oauth.resource_uri,
                &mut oauth.redirect_uri,
            ] {
                *value = Self::expand_string(&re, value);
            }
        }
        for cluster in self.upstream.clusters.values_mut() {
            cluster.api_url = Self::expand_string(&re, &cluster.api_url);
            if let Some(token) = cluster.bearer_token.as_mut() {
                *token = Self::expand_string(&re, token);
            }
        }
        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }

    /// Reject configurations the gateway cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.enabled && self.rate_limit.max_attempts == 0 {
            return Err(Error::Config(
                "rate_limit.max_attempts must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("session.ttl", self.session.ttl),
            ("session.revocation_sweep_interval", self.session.revocation_sweep_interval),
            ("rate_limit.window", self.rate_limit.window),
            ("upstream.sweep_interval", self.upstream.sweep_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be positive")));
            }
        }
        if !self.session.generates_secret() {
            self.session.resolve_secret()?;
        }
        if self.auth.method == AuthenticationMethod::Directory && self.auth.directory.is_none() {
            return Err(Error::Config(
                "auth.method is 'directory' but auth.directory is not configured".to_string(),
            ));
        }
        if !(4..=31).contains(&self.auth.hash_cost) {
            return Err(Error::Config(format!(
                "auth.hash_cost must be between 4 and 31, got {}",
                self.auth.hash_cost
            )));
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Key rate limiting on `X-Forwarded-For` / `X-Real-IP` instead of the peer
    /// address. Only enable behind a proxy that overwrites these headers.
    pub trust_forwarded_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9443,
            shutdown_timeout: Duration::from_secs(30),
            trust_forwarded_headers: false,
        }
    }
}

/// Shortest accepted session signing secret, in bytes
pub const MIN_SECRET_LEN: usize = 32;

/// Session token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signing secret.
    /// Supports: literal value, `env:VAR_NAME`, or `auto` (random per process).
    /// Unset behaves like `auto`.
    pub secret: Option<String>,
    /// Issuer stamped into and required from every token
    pub issuer: String,
    /// Session lifetime
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Per-subject request quota on authenticated routes (per minute, 0 = unlimited)
    pub requests_per_minute: u32,
    /// How often expired revocations are reaped
    #[serde(with = "humantime_serde")]
    pub revocation_sweep_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            issuer: "authgate".to_string(),
            ttl: Duration::from_secs(8 * 3600),
            requests_per_minute: 0,
            revocation_sweep_interval: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    /// Whether the signing secret is generated at startup (`auto` or unset)
    #[must_use]
    pub fn generates_secret(&self) -> bool {
        matches!(self.secret.as_deref(), None | Some("auto"))
    }

    /// Resolve the signing secret (expand `env:`, generate if `auto` or unset)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if an `env:` variable is unset or the
    /// resolved secret is shorter than [`MIN_SECRET_LEN`] bytes.
    pub fn resolve_secret(&self) -> Result<Vec<u8>> {
        let secret = match self.secret.as_deref() {
            None | Some("auto") => {
                use rand::RngExt;
                let random_bytes: [u8; MIN_SECRET_LEN] = rand::rng().random();
                return Ok(random_bytes.to_vec());
            }
            Some(value) => match value.strip_prefix("env:") {
                Some(var_name) => env::var(var_name).map_err(|_| {
                    Error::Config(format!(
                        "session.secret refers to unset environment variable {var_name}"
                    ))
                })?,
                None => value.to_string(),
            },
        };

        if secret.len() < MIN_SECRET_LEN {
            return Err(Error::Config(format!(
                "session.secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        Ok(secret.into_bytes())
    }
}

/// Login rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting on public authentication routes
    pub enabled: bool,
    /// Attempts allowed per client within one window
    pub max_attempts: u32,
    /// Window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            window: Duration::from_secs(60),
        }
    }
}

/// How password credentials are verified
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationMethod {
    /// Against the local user store
    #[default]
    Local,
    /// By binding against the directory service
    Directory,
}

/// Credential verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Strategy for username/password logins
    pub method: AuthenticationMethod,
    /// Local accounts
    pub users: Vec<UserConfig>,
    /// Usernames that always authenticate locally, even in directory mode
    pub local_only_users: Vec<String>,
    /// bcrypt cost for new password hashes
    pub hash_cost: u32,
    /// Upper bound on a single verification (directory bind, SSO exchange)
    #[serde(with = "humantime_serde")]
    pub verify_timeout: Duration,
    /// Directory service
    pub directory: Option<DirectoryConfig>,
    /// External OAuth identity provider
    pub oauth: Option<OAuthProviderConfig>,
    /// Password strength policy
    pub password_policy: PasswordPolicyConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            method: AuthenticationMethod::Local,
            users: Vec::new(),
            local_only_users: vec!["admin".to_string()],
            hash_cost: 10,
            verify_timeout: Duration::from_secs(10),
            directory: None,
            oauth: None,
            password_policy: PasswordPolicyConfig::default(),
        }
    }
}

/// Local account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Username (subject id)
    pub username: String,
    /// bcrypt hash (see `authgate hash-password`)
    #[serde(default)]
    pub password_hash: Option<String>,
    /// Display name (defaults to the username)
    #[serde(default)]
    pub display_name: Option<String>,
    /// Role
    #[serde(default)]
    pub role: Role,
    /// Team memberships
    #[serde(default)]
    pub teams: Vec<String>,
}

/// Directory service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL of the directory bind endpoint
    pub url: String,
    /// Create local records for directory users on first login
    #[serde(default)]
    pub auto_create_users: bool,
    /// Request timeout
    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

/// OAuth identity provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthProviderConfig {
    /// Client id registered with the provider
    pub client_id: String,
    /// Client secret (supports `${VAR}`)
    #[serde(default)]
    pub client_secret: String,
    /// Token endpoint
    pub access_token_uri: String,
    /// Profile endpoint queried with the access token
    pub resource_uri: String,
    /// Redirect URI registered with the provider
    pub redirect_uri: String,
    /// Profile field holding the username
    #[serde(default = "default_user_identifier")]
    pub user_identifier: String,
    /// Profile field holding the display name
    #[serde(default)]
    pub display_name_field: Option<String>,
    /// Create users on first login
    #[serde(default)]
    pub auto_create_users: bool,
    /// Team assigned to auto-created users
    #[serde(default)]
    pub default_team: Option<String>,
    /// Request timeout
    #[serde(default = "default_upstream_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

fn default_user_identifier() -> String {
    "email".to_string()
}

fn default_upstream_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Password strength policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicyConfig {
    /// Minimum password length in characters
    pub min_length: usize,
}

impl Default for PasswordPolicyConfig {
    fn default() -> Self {
        Self { min_length: 12 }
    }
}

/// Upstream credential cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Longest time a minted credential is served from cache
    #[serde(with = "humantime_serde")]
    pub max_ttl: Duration,
    /// Treat entries as expired this long before their expiry
    #[serde(with = "humantime_serde")]
    pub refresh_margin: Duration,
    /// Upper bound on a single mint
    #[serde(with = "humantime_serde")]
    pub mint_timeout: Duration,
    /// How often expired entries are swept
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// Remote clusters keyed by cluster id
    pub clusters: HashMap<String, ClusterConfig>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            max_ttl: Duration::from_secs(15 * 60),
            refresh_margin: Duration::from_secs(30),
            mint_timeout: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            clusters: HashMap::new(),
        }
    }
}

/// Remote cluster whose token API mints per-user credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster API base URL
    pub api_url: String,
    /// Gateway's own credential for the token API (supports `env:` and `${VAR}`)
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Namespace holding the per-user service accounts
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Service account name prefix; the user id is appended
    #[serde(default = "default_service_account_prefix")]
    pub service_account_prefix: String,
    /// Requested credential lifetime
    #[serde(default = "default_token_lifetime", with = "humantime_serde")]
    pub token_lifetime: Duration,
}

fn default_namespace() -> String {
    "authgate".to_string()
}

fn default_service_account_prefix() -> String {
    "authgate-sa-user-".to_string()
}

fn default_token_lifetime() -> Duration {
    Duration::from_secs(3600)
}

impl ClusterConfig {
    /// Resolve the gateway's bearer token (expand `env:`)
    #[must_use]
    pub fn resolve_bearer_token(&self) -> Option<String> {
        self.bearer_token.as_ref().map(|token| {
            if let Some(var_name) = token.strip_prefix("env:") {
                env::var(var_name).unwrap_or_else(|_| token.clone())
            } else {
                token.clone()
            }
        })
    }
}

/// Human-readable serde format for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "2h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Parse "30s", "5m", "2h", "100ms" or bare seconds.
    ///
    /// # Errors
    ///
    /// Returns a message if the number is malformed or the duration overflows.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let number = |digits: &str| {
            digits
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };

        if let Some(ms) = s.strip_suffix("ms") {
            return number(ms).map(Duration::from_millis);
        }
        let (digits, unit_secs) = if let Some(secs) = s.strip_suffix('s') {
            (secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            (mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            (hours, 3600)
        } else {
            (s, 1)
        };

        number(digits)?
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    }
}
