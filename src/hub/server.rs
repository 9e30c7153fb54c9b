//! Hub server
//!
//! Wires the registry, health sweeper, and router together behind one axum
//! application and manages graceful startup and shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::State,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use super::{registry_api, rpc};
use crate::admission::AdmissionControl;
use crate::config::Config;
use crate::registry::{DiscoverFilter, HealthSweeper, ServiceRegistry};
use crate::router::{HttpSpokeTransport, SpokeTransport, ToolRouter};
use crate::{Error, Result};

/// Shared hub request-handling state
pub(crate) struct HubState {
    pub registry: Arc<ServiceRegistry>,
    pub router: Arc<ToolRouter>,
    pub admission: Arc<AdmissionControl>,
    pub request_timeout: Duration,
    /// Client used for immediate recovery probes on heartbeat
    pub probe_client: reqwest::Client,
}

/// The hub process
pub struct Hub {
    config: Config,
    registry: Arc<ServiceRegistry>,
    router: Arc<ToolRouter>,
}

impl Hub {
    /// Create a hub from configuration, recovering registry state from the
    /// snapshot file when one is configured.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ServiceRegistry::with_recovery(config.hub.registry.clone()));
        let transport: Arc<dyn SpokeTransport> = Arc::new(HttpSpokeTransport::new());
        let router = Arc::new(ToolRouter::new(
            Arc::clone(&registry),
            transport,
            config.hub.router.clone(),
        ));
        Self {
            config,
            registry,
            router,
        }
    }

    /// The service registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// The tool router
    #[must_use]
    pub fn router(&self) -> &Arc<ToolRouter> {
        &self.router
    }

    /// Axum application serving `/mcp`, `/health`, and `/registry/*`
    #[must_use]
    pub fn app(&self) -> Router {
        let state = Arc::new(HubState {
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            admission: Arc::new(AdmissionControl::new(
                self.config.hub.server.max_in_flight,
                self.config.hub.server.max_queued,
            )),
            request_timeout: self.config.hub.server.request_timeout,
            probe_client: reqwest::Client::new(),
        });
        create_router(state)
    }

    /// Serve until interrupted. Spawns the health sweeper, serves the
    /// frontend, and drains on shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = (
            self.config.hub.server.host.clone(),
            self.config.hub.server.port,
        );
        let listener = TcpListener::bind((addr.0.as_str(), addr.1))
            .await
            .map_err(|e| Error::Config(format!("hub bind failed: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Config(format!("hub local addr: {e}")))?;

        let admission = Arc::new(AdmissionControl::new(
            self.config.hub.server.max_in_flight,
            self.config.hub.server.max_queued,
        ));
        let state = Arc::new(HubState {
            registry: Arc::clone(&self.registry),
            router: Arc::clone(&self.router),
            admission: Arc::clone(&admission),
            request_timeout: self.config.hub.server.request_timeout,
            probe_client: reqwest::Client::new(),
        });
        let app = create_router(state);

        let cancel = CancellationToken::new();

        // Background health sweeper; purged instances also lose their
        // breaker and permit state.
        let router_for_eviction = Arc::clone(&self.router);
        let sweeper = HealthSweeper::new(Arc::clone(&self.registry))
            .with_eviction(Arc::new(move |instance_id: &str| {
                router_for_eviction.evict_instance(instance_id);
            }))
            .spawn(cancel.clone());

        let serve_cancel = cancel.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
                .await
        });

        info!(address = %local, "Hub serving");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
            }
            res = &mut server => {
                error!("Server exited unexpectedly");
                cancel.cancel();
                return res
                    .map_err(|e| Error::Internal(format!("server task: {e}")))?
                    .map_err(Error::from);
            }
        }

        cancel.cancel();
        if admission
            .drain(self.config.hub.server.shutdown_timeout)
            .await
        {
            info!("Drained in-flight requests");
        } else {
            warn!("Shutdown timeout elapsed with requests still in flight");
        }
        let _ = server.await;
        let _ = sweeper.await;

        info!("Hub shutdown complete");
        Ok(())
    }
}

/// Build the hub router
pub(crate) fn create_router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/mcp", post(rpc::mcp_handler))
        .route("/health", get(health_handler))
        .route("/registry/register", post(registry_api::register_handler))
        .route(
            "/registry/{instance_id}",
            delete(registry_api::deregister_handler),
        )
        .route(
            "/registry/{instance_id}/heartbeat",
            post(registry_api::heartbeat_handler),
        )
        .route("/registry/discover", get(registry_api::discover_handler))
        .route("/registry/tools", get(registry_api::tools_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Hub liveness and a coarse mesh summary
async fn health_handler(State(state): State<Arc<HubState>>) -> impl IntoResponse {
    let instances = state.registry.discover(&DiscoverFilter::default());
    let passing = instances
        .iter()
        .filter(|i| i.status == crate::registry::HealthStatus::Passing)
        .count();
    Json(json!({
        "status": "Passing",
        "version": env!("CARGO_PKG_VERSION"),
        "instances": instances.len(),
        "passing": passing,
    }))
}
