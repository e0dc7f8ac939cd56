//! Gateway server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::auth::Authenticator;
use super::router::{AppState, create_router};
use crate::cache::{self, ClaimsCache};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::identity::{CognitoIdentityProvider, IdentityProvider};
use crate::keyset::{HttpKeySetSource, KeySetManager};
use crate::registry::RouteRegistry;
use crate::token::{TokenValidator, ValidatorSettings};
use crate::{Error, Result};

/// Authorizing API gateway
pub struct Gateway {
    /// Configuration
    config: Config,
    /// Request pipeline state
    state: Arc<AppState>,
}

impl Gateway {
    /// Build every collaborator the pipeline needs.
    ///
    /// Fails if the configuration is invalid or the signing key set cannot be
    /// loaded; no request is served without keys.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(RouteRegistry::from_services(&config.services)?);
        if registry.is_empty() {
            warn!("No routes configured - every request will return 404");
        }

        let jwks_uri = config
            .auth
            .resolve_jwks_uri()
            .ok_or_else(|| Error::Config("JWKS URI cannot be derived".to_string()))?;
        let source = HttpKeySetSource::new(
            jwks_uri,
            config.auth.jwks_fetch_timeout,
            config.auth.require_https,
        )?;
        let keys = Arc::new(KeySetManager::new(Arc::new(source)).await?);

        let identity: Option<Arc<dyn IdentityProvider>> = if config.auth.secondary_verification {
            let endpoint = config
                .auth
                .resolve_identity_provider_endpoint()
                .ok_or_else(|| Error::Config("identity provider endpoint cannot be derived".to_string()))?;
            let provider = CognitoIdentityProvider::new(endpoint, config.auth.identity_provider_timeout)
                .map_err(|e| Error::Internal(e.to_string()))?;
            Some(Arc::new(provider))
        } else {
            None
        };

        let issuer = config
            .auth
            .resolve_issuer()
            .ok_or_else(|| Error::Config("issuer cannot be derived".to_string()))?;
        let validator = TokenValidator::new(
            Arc::clone(&keys),
            identity,
            ValidatorSettings {
                issuer,
                role_claim: config.auth.role_claim.clone(),
                leeway_secs: config.auth.leeway_secs,
            },
        );

        let claims_cache = cache::build_store(&config.cache)?.map(|store| Arc::new(ClaimsCache::new(store)));

        let dispatcher = Dispatcher::new(config.gateway.upstream_timeout, config.server.max_body_size)
            .map_err(|e| Error::Internal(e.to_string()))?;

        let state = Arc::new(AppState {
            registry,
            authenticator: Authenticator::new(Arc::new(validator), claims_cache),
            dispatcher,
            keys,
            sign_out_path: config.gateway.sign_out_path.clone(),
            request_timeout: config.server.request_timeout,
        });

        Ok(Self { config, state })
    }

    /// Run until SIGINT/SIGTERM, then drain in-flight requests.
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

        let refresher = Arc::clone(&self.state.keys)
            .spawn_refresher(self.config.auth.jwks_refresh_interval, shutdown_tx.subscribe());
        let sweeper = self
            .state
            .authenticator
            .cache()
            .map(|c| cache::spawn_sweeper(Arc::clone(c.backend()), self.config.cache.sweep_interval, shutdown_tx.subscribe()));

        let app = create_router(Arc::clone(&self.state));
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("API GATEWAY v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            routes = self.state.registry.len(),
            keys = self.state.keys.snapshot().len(),
            cache = self.state.authenticator.cache().map_or("disabled", |c| c.backend().backend_name()),
            secondary_verification = self.config.auth.secondary_verification,
            "Pipeline ready"
        );
        for route in self.state.registry.routes() {
            info!(
                "  {:<40} -> {} [{}]",
                route.pattern,
                route.target,
                route.required_roles.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        info!("============================================================");

        let mut shutdown_rx = shutdown_tx.subscribe();
        let serve = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .into_future();

        // In-flight requests get `shutdown_timeout` to finish once the signal fires
        let shutdown_timeout = self.config.server.shutdown_timeout;
        let result = tokio::select! {
            served = serve => served.map_err(|e| Error::Internal(e.to_string())),
            () = async {
                let _ = shutdown_rx.recv().await;
                tokio::time::sleep(shutdown_timeout).await;
            } => {
                warn!(timeout = ?shutdown_timeout, "In-flight requests did not finish before the shutdown timeout");
                Ok(())
            }
        };

        // Stop background tasks even if serving failed
        let _ = shutdown_tx.send(());
        let _ = refresher.await;
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }

        info!("Gateway stopped");
        result
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
            Ok(mut sig) => {
                sig.recv().await;
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
