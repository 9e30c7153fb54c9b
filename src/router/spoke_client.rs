//! Spoke call transport
//!
//! The router talks to spoke instances through the [`SpokeTransport`] trait
//! so dispatch logic stays testable against in-memory fakes. The production
//! implementation speaks JSON-RPC over HTTP with reqwest.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::context::RequestContext;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::registry::ServiceInstance;
use crate::{Error, Result, error::rpc_codes};

/// Header carrying the correlation id across hop boundaries
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Delivers `tools/call` to one spoke instance.
///
/// Implementations must be cancellation-safe: the router drops the returned
/// future on deadline expiry or caller abort, which must abort the
/// underlying request rather than leave it orphaned.
#[async_trait]
pub trait SpokeTransport: Send + Sync + 'static {
    /// Invoke `tool` on `instance` and return the raw result value
    async fn call_tool(
        &self,
        instance: &ServiceInstance,
        tool: &str,
        arguments: Value,
        ctx: &RequestContext,
    ) -> Result<Value>;
}

/// JSON-RPC over HTTP spoke transport
pub struct HttpSpokeTransport {
    client: reqwest::Client,
    request_id: AtomicU64,
}

impl HttpSpokeTransport {
    /// Create a transport with connection pooling tuned for many small RPCs
    #[must_use]
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .unwrap_or_default();
        Self {
            client,
            request_id: AtomicU64::new(1),
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed) as i64)
    }
}

impl Default for HttpSpokeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SpokeTransport for HttpSpokeTransport {
    async fn call_tool(
        &self,
        instance: &ServiceInstance,
        tool: &str,
        arguments: Value,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let request = JsonRpcRequest::new(
            self.next_id(),
            "tools/call",
            Some(json!({"name": tool, "arguments": arguments})),
        );

        debug!(
            instance = %instance.id,
            tool,
            correlation = ctx.correlation_id(),
            "Dispatching spoke call"
        );

        let response = self
            .client
            .post(&instance.address)
            .header(CORRELATION_HEADER, ctx.correlation_id())
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("spoke {}: {e}", instance.id)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Error::Transport(format!(
                "spoke {} returned {status}",
                instance.id
            )));
        }
        if !status.is_success() {
            return Err(Error::Internal(format!(
                "spoke {} returned {status}",
                instance.id
            )));
        }

        let rpc: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| Error::Transport(format!("spoke {}: {e}", instance.id)))?;

        if let Some(err) = rpc.error {
            return Err(error_from_rpc(tool, err.code, err.message, err.data));
        }
        rpc.result
            .ok_or_else(|| Error::Internal(format!("spoke {} sent empty response", instance.id)))
    }
}

/// Map a downstream JSON-RPC error object onto the error taxonomy so the
/// kinds survive the hop unchanged.
fn error_from_rpc(tool: &str, code: i32, message: String, data: Option<Value>) -> Error {
    match code {
        rpc_codes::METHOD_NOT_FOUND | rpc_codes::TOOL_NOT_FOUND => Error::ToolNotFound(message),
        rpc_codes::INVALID_PARAMS => Error::InvalidParams(message),
        rpc_codes::DATA_NOT_FOUND => Error::DataNotFound(message),
        rpc_codes::PROVIDER_RATE_LIMITED => Error::ProviderRateLimited(message),
        rpc_codes::HANDLER_FAILURE => Error::HandlerFailure {
            tool: tool.to_string(),
            message,
        },
        rpc_codes::DEADLINE_EXCEEDED => Error::SpokeTimeout(message),
        _ => Error::JsonRpc {
            code,
            message,
            data,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downstream_codes_map_onto_taxonomy() {
        assert!(matches!(
            error_from_rpc("t", -32602, "bad".into(), None),
            Error::InvalidParams(_)
        ));
        assert!(matches!(
            error_from_rpc("t", -32020, "boom".into(), None),
            Error::HandlerFailure { .. }
        ));
        assert!(matches!(
            error_from_rpc("t", -32012, "absent".into(), None),
            Error::DataNotFound(_)
        ));
        // Unknown application codes pass through unchanged.
        let passthrough = error_from_rpc("t", -32011, "agg".into(), None);
        assert_eq!(passthrough.to_rpc_code(), -32011);
    }

    #[test]
    fn handler_failure_is_not_retryable_but_transport_is() {
        let handler = error_from_rpc("t", -32020, "boom".into(), None);
        assert!(!handler.is_retryable());
        assert!(Error::Transport("refused".into()).is_retryable());
    }
}
