//! authgate library
//!
//! Authentication gateway in front of a multi-tenant container-management
//! backend.
//!
//! # Features
//!
//! - **Login strategies**: local bcrypt passwords, directory bind, OAuth code exchange
//! - **Session tokens**: HS256 JWTs with logout revocation
//! - **Route policies**: public, authenticated, role- or team-restricted
//! - **Brute-force protection**: fixed-window rate limiting on public auth routes
//! - **Upstream credentials**: per-user cluster tokens, cached with single-flight minting

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod token;
pub mod upstream;
pub mod verifier;

pub use error::{AuthError, Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
