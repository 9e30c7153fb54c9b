//! Registry HTTP surface: `/registry/*`
//!
//! Spokes register, heartbeat, and deregister here; operators and tests use
//! the discovery endpoints. Payloads are JSON; status codes follow the
//! error taxonomy.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::server::HubState;
use crate::registry::{
    DiscoverFilter, HealthStatus, Registration, probe_health_endpoint,
};
use crate::Error;

fn error_response(e: &Error) -> (StatusCode, Json<serde_json::Value>) {
    let status = match e {
        Error::Registration(_) => StatusCode::CONFLICT,
        Error::UnknownInstance(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({"code": e.to_rpc_code(), "message": e.to_string()})),
    )
}

/// POST /registry/register
pub(crate) async fn register_handler(
    State(state): State<Arc<HubState>>,
    Json(registration): Json<Registration>,
) -> impl IntoResponse {
    match state.registry.register(registration) {
        Ok(instance) => (StatusCode::OK, Json(json!(instance))).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

/// DELETE /registry/{instance_id}
pub(crate) async fn deregister_handler(
    State(state): State<Arc<HubState>>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.deregister(&instance_id) {
        Ok(_) => {
            state.router.evict_instance(&instance_id);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

/// POST /registry/{instance_id}/heartbeat
///
/// A heartbeat from a `Critical` instance triggers an immediate recovery
/// probe: if the instance's own health endpoint passes now, it returns to
/// `Passing` without waiting for the next sweep.
pub(crate) async fn heartbeat_handler(
    State(state): State<Arc<HubState>>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.heartbeat(&instance_id) {
        Ok((status, health_endpoint)) => {
            if status == HealthStatus::Critical {
                let probe_timeout = state.registry.config().probe_timeout;
                let healthy = probe_health_endpoint(
                    &state.probe_client,
                    &health_endpoint,
                    probe_timeout,
                )
                .await;
                if healthy {
                    state.registry.record_probe_success(&instance_id);
                    info!(instance = %instance_id, "Critical instance recovered on heartbeat");
                }
            }
            let current = state
                .registry
                .instance(&instance_id)
                .map_or(status, |i| i.status);
            (
                StatusCode::OK,
                Json(json!({"status": current.as_str()})),
            )
                .into_response()
        }
        Err(e) => error_response(&e).into_response(),
    }
}

/// Query parameters for GET /registry/discover
#[derive(Debug, Deserialize)]
pub(crate) struct DiscoverQuery {
    name: Option<String>,
    tag: Option<String>,
    #[serde(rename = "minStatus")]
    min_status: Option<String>,
}

fn parse_status(raw: Option<&str>) -> Result<Option<HealthStatus>, String> {
    match raw {
        None => Ok(None),
        Some("Passing" | "passing") => Ok(Some(HealthStatus::Passing)),
        Some("Warning" | "warning") => Ok(Some(HealthStatus::Warning)),
        Some("Critical" | "critical") => Ok(Some(HealthStatus::Critical)),
        Some("Unknown" | "unknown") => Ok(Some(HealthStatus::Unknown)),
        Some(other) => Err(format!("unknown status '{other}'")),
    }
}

/// GET /registry/discover?name=&tag=&minStatus=
pub(crate) async fn discover_handler(
    State(state): State<Arc<HubState>>,
    Query(query): Query<DiscoverQuery>,
) -> impl IntoResponse {
    let min_status = match parse_status(query.min_status.as_deref()) {
        Ok(s) => s,
        Err(msg) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"message": msg}))).into_response();
        }
    };
    let filter = DiscoverFilter {
        name: query.name,
        tag: query.tag,
        min_status,
    };
    let instances = state.registry.discover(&filter);
    debug!(matched = instances.len(), "Discovery query");
    Json(json!(instances)).into_response()
}

/// Query parameters for GET /registry/tools
#[derive(Debug, Deserialize)]
pub(crate) struct ToolsQuery {
    #[serde(rename = "minStatus")]
    min_status: Option<String>,
}

/// GET /registry/tools?minStatus=
pub(crate) async fn tools_handler(
    State(state): State<Arc<HubState>>,
    Query(query): Query<ToolsQuery>,
) -> impl IntoResponse {
    let min_status = match parse_status(query.min_status.as_deref()) {
        Ok(s) => s.unwrap_or(HealthStatus::Passing),
        Err(msg) => {
            return (StatusCode::BAD_REQUEST, Json(json!({"message": msg}))).into_response();
        }
    };
    let tools = state.registry.list_tools(min_status);
    Json(json!(tools)).into_response()
}
