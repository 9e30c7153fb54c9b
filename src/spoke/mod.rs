//! Spoke runtime
//!
//! Hosts a tool set behind a JSON-RPC endpoint, registers with the hub on
//! startup, maintains heartbeats and a health endpoint, and drains
//! in-flight calls on graceful shutdown.

mod handler;
mod hub_client;
pub mod market;
pub mod portfolio;
pub mod risk;
mod schema;

pub use handler::{HandlerFn, ToolSet};
pub use hub_client::HubClient;
pub use schema::{SchemaValidationResult, ValidationViolation, validate_arguments};

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionControl;
use crate::config::SpokeConfig;
use crate::context::RequestContext;
use crate::protocol::{
    InitializeResult, Info, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId,
    ServerCapabilities, ToolsCallParams, ToolsListResult,
};
use crate::registry::{Registration, ToolDescriptor};
use crate::router::CORRELATION_HEADER;
use crate::{Error, Result};

/// Concurrently-executing inbound call ceiling
const MAX_IN_FLIGHT: usize = 256;
/// Bounded wait queue beyond the in-flight ceiling
const MAX_QUEUED: usize = 1024;

/// Shared request-handling state
struct SpokeState {
    service_name: String,
    tools: Arc<ToolSet>,
    request_timeout: std::time::Duration,
    /// Inbound admission gate; shutdown drains through it
    admission: Arc<AdmissionControl>,
}

/// A spoke process hosting one tool set
pub struct Spoke {
    config: SpokeConfig,
    instance_id: String,
    tools: Arc<ToolSet>,
}

impl Spoke {
    /// Create a spoke with a fresh instance id
    #[must_use]
    pub fn new(config: SpokeConfig) -> Self {
        let instance_id = format!("{}-{}", config.name, Uuid::new_v4());
        Self {
            config,
            instance_id,
            tools: Arc::new(ToolSet::new()),
        }
    }

    /// Unique id for this process lifetime
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The tool table
    #[must_use]
    pub fn tools(&self) -> &Arc<ToolSet> {
        &self.tools
    }

    /// Register a tool; the descriptor's owning service is forced to this
    /// spoke's name
    pub fn register_tool<F, Fut>(&self, mut descriptor: ToolDescriptor, handler: F)
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        descriptor.owning_service = self.config.name.clone();
        self.tools.register(descriptor, handler);
    }

    /// Axum application serving `/mcp` and `/health`
    #[must_use]
    pub fn app(&self) -> Router {
        let state = Arc::new(SpokeState {
            service_name: self.config.name.clone(),
            tools: Arc::clone(&self.tools),
            request_timeout: self.config.request_timeout,
            admission: Arc::new(AdmissionControl::new(MAX_IN_FLIGHT, MAX_QUEUED)),
        });
        Router::new()
            .route("/mcp", post(rpc_handler))
            .route("/health", get(health_handler))
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Serve until interrupted: bind, register with the hub, heartbeat,
    /// then deregister and drain on shutdown.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| Error::Config(format!("spoke bind failed: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Config(format!("spoke local addr: {e}")))?;

        let state = Arc::new(SpokeState {
            service_name: self.config.name.clone(),
            tools: Arc::clone(&self.tools),
            request_timeout: self.config.request_timeout,
            admission: Arc::new(AdmissionControl::new(MAX_IN_FLIGHT, MAX_QUEUED)),
        });
        let admission = Arc::clone(&state.admission);

        let app = Router::new()
            .route("/mcp", post(rpc_handler))
            .route("/health", get(health_handler))
            .layer(CatchPanicLayer::new())
            .layer(TraceLayer::new_for_http())
            .with_state(state);

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { serve_cancel.cancelled().await })
                .await
        });

        info!(
            service = %self.config.name,
            instance = %self.instance_id,
            address = %local,
            tools = self.tools.len(),
            "Spoke serving"
        );

        // Register with the hub; startup fails if the deadline passes.
        let hub = HubClient::new(&self.config.hub_address);
        let registration = Registration {
            id: self.instance_id.clone(),
            name: self.config.name.clone(),
            address: format!("http://{local}/mcp"),
            tags: self.config.tags.iter().cloned().collect(),
            metadata: self.config.metadata.clone(),
            health_endpoint: format!("http://{local}/health"),
            tools: self.tools.descriptors(),
        };
        if let Err(e) = hub
            .register_with_retry(&registration, self.config.startup_registration_deadline)
            .await
        {
            cancel.cancel();
            let _ = server.await;
            return Err(e);
        }

        // Heartbeat until shutdown.
        let heartbeat_hub = HubClient::new(&self.config.hub_address);
        let heartbeat_id = self.instance_id.clone();
        let heartbeat_cancel = cancel.clone();
        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = heartbeat_cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = heartbeat_hub.heartbeat(&heartbeat_id).await {
                            warn!(error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        });

        // Wait for interrupt.
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
            }
            res = &mut server => {
                error!("Server exited unexpectedly");
                return res
                    .map_err(|e| Error::Internal(format!("server task: {e}")))?
                    .map_err(Error::from);
            }
        }

        // Graceful shutdown: deregister first so the hub stops routing to
        // us, then drain in-flight calls within the grace window.
        if let Err(e) = hub.deregister(&self.instance_id).await {
            warn!(error = %e, "Deregistration failed");
        }
        cancel.cancel();
        heartbeat.abort();

        if admission.drain(self.config.shutdown_grace).await {
            info!("Drained in-flight calls");
        } else {
            warn!("Shutdown grace elapsed with calls still in flight");
        }
        let _ = server.await;

        info!("Spoke shutdown complete");
        Ok(())
    }
}

/// GET /health — always `Passing` while the process serves
async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "Passing"}))
}

/// POST /mcp — JSON-RPC dispatcher for this spoke
async fn rpc_handler(
    State(state): State<Arc<SpokeState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Ok(_permit) = state.admission.admit().await else {
        let resp = JsonRpcResponse::error(None, -32006, "spoke at capacity");
        return (StatusCode::OK, Json(serde_json::to_value(resp).unwrap_or_default()));
    };

    let parsed: std::result::Result<Value, _> = serde_json::from_slice(&body);
    let Ok(message) = parsed else {
        let resp = JsonRpcResponse::error(None, -32700, "invalid JSON");
        return (StatusCode::OK, Json(serde_json::to_value(resp).unwrap_or_default()));
    };

    // Notifications carry no id and get no response body.
    if message.get("id").is_none() {
        return (StatusCode::ACCEPTED, Json(Value::Null));
    }

    let request: JsonRpcRequest = match serde_json::from_value(message) {
        Ok(r) => r,
        Err(e) => {
            let resp =
                JsonRpcResponse::error(None, -32600, format!("invalid request: {e}"));
            return (StatusCode::OK, Json(serde_json::to_value(resp).unwrap_or_default()));
        }
    };

    let correlation = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    let response = handle_request(&state, request, correlation).await;
    (StatusCode::OK, Json(serde_json::to_value(response).unwrap_or_default()))
}

async fn handle_request(
    state: &SpokeState,
    request: JsonRpcRequest,
    correlation: Option<String>,
) -> JsonRpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => {
            let result = InitializeResult {
                protocol_version: PROTOCOL_VERSION.to_string(),
                capabilities: ServerCapabilities::tools_only(),
                server_info: Info {
                    name: state.service_name.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            };
            JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
        }
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => {
            let result = ToolsListResult {
                tools: state.tools.as_protocol_tools(),
            };
            JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
        }
        "tools/call" => handle_tools_call(state, id, request.params, correlation).await,
        other => JsonRpcResponse::error(
            Some(id),
            -32601,
            format!("method not found: {other}"),
        ),
    }
}

async fn handle_tools_call(
    state: &SpokeState,
    id: RequestId,
    params: Option<Value>,
    correlation: Option<String>,
) -> JsonRpcResponse {
    let params: ToolsCallParams = match params
        .ok_or_else(|| "missing params".to_string())
        .and_then(|p| serde_json::from_value(p).map_err(|e| e.to_string()))
    {
        Ok(p) => p,
        Err(e) => {
            return JsonRpcResponse::error(Some(id), -32602, format!("invalid params: {e}"));
        }
    };

    let ctx = match correlation {
        Some(c) => RequestContext::with_correlation_id(c, state.request_timeout),
        None => RequestContext::new(state.request_timeout),
    };

    match state.tools.call(&params.name, params.arguments, ctx.clone()).await {
        Ok(value) => JsonRpcResponse::success(id, value),
        Err(e) => JsonRpcResponse::error_with_data(
            Some(id),
            e.to_rpc_code(),
            e.to_string(),
            e.to_rpc_data(ctx.correlation_id()),
        ),
    }
}
