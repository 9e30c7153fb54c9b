//! Error types for Fin-Hub

use std::io;

use thiserror::Error;

/// Result type alias for Fin-Hub
pub type Result<T> = std::result::Result<T, Error>;

/// Fin-Hub errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Registration rejected (tool name collision, storage failure, ...)
    #[error("Registration rejected: {0}")]
    Registration(String),

    /// Operation referenced an instance id the registry does not know
    #[error("Unknown instance: {0}")]
    UnknownInstance(String),

    /// Unknown tool name
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Registry returned no Passing instance for the owning service
    #[error("No healthy instance for service: {0}")]
    NoHealthyInstance(String),

    /// Every candidate's circuit breaker is open and no probe is permitted
    #[error("All instances open for tool: {0}")]
    AllInstancesOpen(String),

    /// Context deadline reached
    #[error("Deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Caller aborted the request
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Inbound queue overflow
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Every configured provider is rate-limited
    #[error("Provider rate limited: {0}")]
    ProviderRateLimited(String),

    /// No provider produced a result
    #[error("All providers failed for operation '{operation}'")]
    AllProvidersFailed {
        /// Logical operation that failed
        operation: String,
        /// Per-provider error breakdown, sanitized of credentials
        breakdown: Vec<(String, String)>,
    },

    /// Provider returned authoritative absence
    #[error("Data not found: {0}")]
    DataNotFound(String),

    /// Tool handler failed
    #[error("Handler failure in '{tool}': {message}")]
    HandlerFailure {
        /// Qualified tool name
        tool: String,
        /// Handler error message
        message: String,
    },

    /// Invalid tool arguments (schema violation)
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Unknown JSON-RPC method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// JSON-RPC shape violation
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Transport error (network, connection)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Spoke call timeout
    #[error("Spoke timeout: {0}")]
    SpokeTimeout(String),

    /// JSON-RPC error returned by a downstream peer
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Convert to a JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::InvalidRequest(_) => rpc_codes::INVALID_REQUEST,
            Self::MethodNotFound(_) => rpc_codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => rpc_codes::INVALID_PARAMS,
            Self::ToolNotFound(_) => rpc_codes::TOOL_NOT_FOUND,
            Self::NoHealthyInstance(_) => rpc_codes::NO_HEALTHY_INSTANCE,
            Self::AllInstancesOpen(_) => rpc_codes::ALL_INSTANCES_OPEN,
            Self::DeadlineExceeded(_) | Self::SpokeTimeout(_) => rpc_codes::DEADLINE_EXCEEDED,
            Self::Cancelled(_) => rpc_codes::CANCELLED,
            Self::ResourceExhausted(_) => rpc_codes::RESOURCE_EXHAUSTED,
            Self::ProviderRateLimited(_) => rpc_codes::PROVIDER_RATE_LIMITED,
            Self::AllProvidersFailed { .. } => rpc_codes::ALL_PROVIDERS_FAILED,
            Self::DataNotFound(_) => rpc_codes::DATA_NOT_FOUND,
            Self::HandlerFailure { .. } => rpc_codes::HANDLER_FAILURE,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// Whether the router may retry this failure against another instance.
    ///
    /// Only infrastructure failures count; client-input and application
    /// errors surface immediately and never trip a breaker.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::SpokeTimeout(_) | Self::Http(_) | Self::Io(_)
        )
    }

    /// Build the JSON-RPC error `data` payload: correlation id plus, for
    /// aggregator failures, the per-provider breakdown. Credentials never
    /// reach this payload — provider errors are sanitized at the source.
    #[must_use]
    pub fn to_rpc_data(&self, correlation_id: &str) -> serde_json::Value {
        let mut data = serde_json::json!({"correlationId": correlation_id});
        match self {
            Self::AllProvidersFailed {
                operation,
                breakdown,
            } => {
                data["operation"] = serde_json::Value::String(operation.clone());
                data["providerErrors"] = serde_json::Value::Array(
                    breakdown
                        .iter()
                        .map(|(provider, message)| {
                            serde_json::json!({"provider": provider, "error": message})
                        })
                        .collect(),
                );
            }
            Self::JsonRpc {
                data: Some(inner), ..
            } => {
                data["cause"] = inner.clone();
            }
            _ => {}
        }
        data
    }
}

/// JSON-RPC error codes: the standard set plus the application range
/// used for registry, routing, and aggregation failures.
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Unknown tool name
    pub const TOOL_NOT_FOUND: i32 = -32001;
    /// No Passing instance for the owning service
    pub const NO_HEALTHY_INSTANCE: i32 = -32002;
    /// Every candidate breaker open, no probe permitted
    pub const ALL_INSTANCES_OPEN: i32 = -32003;
    /// Context deadline reached
    pub const DEADLINE_EXCEEDED: i32 = -32004;
    /// Caller aborted
    pub const CANCELLED: i32 = -32005;
    /// Inbound queue overflow
    pub const RESOURCE_EXHAUSTED: i32 = -32006;
    /// All providers rate-limited
    pub const PROVIDER_RATE_LIMITED: i32 = -32010;
    /// No provider produced a result
    pub const ALL_PROVIDERS_FAILED: i32 = -32011;
    /// Provider returned authoritative absence
    pub const DATA_NOT_FOUND: i32 = -32012;
    /// Tool handler failed
    pub const HANDLER_FAILURE: i32 = -32020;
}
