//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::bouncer::{self, Bouncer};
use super::rate_limit::{self, RateLimiter};
use super::router::{AppState, create_router};
use super::service::AuthGateway;
use crate::config::{AuthenticationMethod, Config};
use crate::token::{RevocationList, TokenCodec, revocation};
use crate::upstream::{
    ClusterCredentialBroker, KubernetesTokenMinter, UpstreamCredentialCache, cache,
};
use crate::verifier::{CredentialVerifier, InMemoryUserStore, UserStore};
use crate::{Error, Result};

/// Authentication gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Router state
    state: Arc<AppState>,
    /// Route policy enforcement
    bouncer: Arc<Bouncer>,
    /// Login rate limiter
    limiter: Arc<RateLimiter>,
    /// Upstream credentials for the reverse proxy
    broker: ClusterCredentialBroker,
}

impl Gateway {
    /// Wire every component from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid (including a weak or
    /// unresolvable session secret) or an HTTP client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let users: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::from_config(&config.auth.users));
        let verifier = Arc::new(CredentialVerifier::from_config(&config.auth, users)?);

        let codec = Arc::new(TokenCodec::new(
            &config.session.resolve_secret()?,
            config.session.issuer.clone(),
        ));
        let revocations = Arc::new(RevocationList::new());
        let upstream = UpstreamCredentialCache::from_config(&config.upstream);
        let broker = ClusterCredentialBroker::new(
            upstream.clone(),
            Arc::new(KubernetesTokenMinter::new(&config.upstream)?),
        );

        let gateway = Arc::new(AuthGateway::new(
            verifier,
            Arc::clone(&codec),
            Arc::clone(&revocations),
            upstream.clone(),
            config.session.ttl,
            config.auth.verify_timeout,
        ));

        let bouncer = Arc::new(
            Bouncer::new(codec, Arc::clone(&revocations))
                .with_quota(config.session.requests_per_minute),
        );
        let limiter = Arc::new(RateLimiter::from_config(
            &config.rate_limit,
            config.server.trust_forwarded_headers,
        ));

        let state = Arc::new(AppState {
            gateway,
            revocations,
            upstream,
        });

        Ok(Self {
            config,
            state,
            bouncer,
            limiter,
            broker,
        })
    }

    /// The HTTP router.
    #[must_use]
    pub fn router(&self) -> Router {
        create_router(
            Arc::clone(&self.state),
            &self.bouncer,
            Arc::clone(&self.limiter),
        )
    }

    /// Upstream credential broker for the reverse-proxy layer.
    #[must_use]
    pub fn broker(&self) -> &ClusterCredentialBroker {
        &self.broker
    }

    /// Run the gateway until a shutdown signal arrives.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);

        revocation::spawn_reaper(
            Arc::clone(&self.state.revocations),
            self.config.session.revocation_sweep_interval,
            shutdown_tx.subscribe(),
        );
        if self.bouncer.has_quota() {
            bouncer::spawn_quota_sweeper(
                Arc::clone(&self.bouncer),
                self.config.session.revocation_sweep_interval,
                shutdown_tx.subscribe(),
            );
        }
        rate_limit::spawn_sweeper(
            Arc::clone(&self.limiter),
            self.config.rate_limit.window,
            shutdown_tx.subscribe(),
        );
        cache::spawn_sweeper(
            self.state.upstream.clone(),
            self.config.upstream.sweep_interval,
            shutdown_tx.subscribe(),
        );

        let app = self.router();
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("AUTHGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        match self.config.auth.method {
            AuthenticationMethod::Local => {
                info!(users = self.config.auth.users.len(), "Password logins: local accounts");
            }
            AuthenticationMethod::Directory => info!("Password logins: directory bind"),
        }
        if self.config.auth.oauth.is_some() {
            info!("OAuth code exchange enabled");
        }
        if self.config.rate_limit.enabled {
            info!(
                max_attempts = self.config.rate_limit.max_attempts,
                window = ?self.config.rate_limit.window,
                "Login rate limiting enabled"
            );
        } else {
            warn!("Login rate limiting disabled");
        }
        if self.config.session.generates_secret() {
            warn!("Session secret generated at startup; tokens will not survive a restart");
        }
        info!(clusters = self.config.upstream.clusters.len(), "Upstream clusters configured");
        info!("============================================================");

        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .into_future();

        let mut drain_rx = shutdown_tx.subscribe();
        let drain_timeout = self.config.server.shutdown_timeout;
        tokio::select! {
            result = server => result.map_err(|e| Error::Internal(e.to_string()))?,
            () = async {
                let _ = drain_rx.recv().await;
                tokio::time::sleep(drain_timeout).await;
            } => {
                warn!(timeout = ?drain_timeout, "Open connections did not drain in time");
            }
        }

        info!("Shutdown complete");
        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
