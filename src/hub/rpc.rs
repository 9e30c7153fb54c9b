//! MCP frontend: JSON-RPC 2.0 dispatcher on `POST /mcp`
//!
//! Decodes inbound messages, routes by method, and serializes responses.
//! Requests run in parallel under the admission gate; each gets its own
//! [`RequestContext`]. Notifications are accepted without a response body.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::server::HubState;
use crate::context::RequestContext;
use crate::protocol::{
    InitializeResult, Info, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId,
    ServerCapabilities, Tool, ToolsCallParams, ToolsListResult,
};
use crate::registry::HealthStatus;
use crate::router::CORRELATION_HEADER;

/// POST /mcp
pub(crate) async fn mcp_handler(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let parsed: Result<Value, _> = serde_json::from_slice(&body);
    let Ok(message) = parsed else {
        return rpc_response(JsonRpcResponse::error(None, -32700, "invalid JSON"));
    };

    // Notifications (no id) are accepted and produce no response.
    if message.get("id").is_none() {
        debug!(
            method = message.get("method").and_then(|v| v.as_str()),
            "Notification accepted"
        );
        return (StatusCode::ACCEPTED, Json(Value::Null));
    }

    let request: JsonRpcRequest = match serde_json::from_value(message) {
        Ok(r) => r,
        Err(e) => {
            return rpc_response(JsonRpcResponse::error(
                None,
                -32600,
                format!("invalid request: {e}"),
            ));
        }
    };
    let id = request.id.clone();

    // Admission: bounded concurrency with a bounded queue; overflow is
    // rejected rather than buffered without limit.
    let _permit = match state.admission.admit().await {
        Ok(p) => p,
        Err(e) => {
            return rpc_response(JsonRpcResponse::error(
                Some(id),
                e.to_rpc_code(),
                e.to_string(),
            ));
        }
    };

    let correlation = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from);

    rpc_response(handle_request(&state, request, correlation).await)
}

fn rpc_response(response: JsonRpcResponse) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(serde_json::to_value(response).unwrap_or_default()),
    )
}

async fn handle_request(
    state: &HubState,
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
                    name: "fin-hub".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                },
            };
            JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
        }
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => {
            // Only tools with at least one Passing instance are advertised.
            let tools: Vec<Tool> = state
                .registry
                .list_tools(HealthStatus::Passing)
                .into_iter()
                .map(|d| Tool {
                    name: d.qualified_name,
                    description: (!d.description.is_empty()).then_some(d.description),
                    input_schema: d.input_schema,
                    output_schema: d.output_schema,
                })
                .collect();
            let result = ToolsListResult { tools };
            JsonRpcResponse::success(id, serde_json::to_value(result).unwrap_or_default())
        }
        "tools/call" => handle_tools_call(state, id, request.params, correlation).await,
        other => {
            JsonRpcResponse::error(Some(id), -32601, format!("method not found: {other}"))
        }
    }
}

async fn handle_tools_call(
    state: &HubState,
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

    info!(
        tool = %params.name,
        correlation = ctx.correlation_id(),
        "Dispatching tool call"
    );

    match state.router.dispatch(&params.name, params.arguments, &ctx).await {
        Ok(result) => JsonRpcResponse::success(id, result),
        Err(e) => JsonRpcResponse::error_with_data(
            Some(id),
            e.to_rpc_code(),
            e.to_string(),
            e.to_rpc_data(ctx.correlation_id()),
        ),
    }
}
