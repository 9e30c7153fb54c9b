//! MCP protocol types and JSON-RPC message structures

mod messages;
mod types;

pub use messages::{
    InitializeParams, InitializeResult, JsonRpcError, JsonRpcMessage, JsonRpcNotification,
    JsonRpcRequest, JsonRpcResponse, RequestId, ToolsCallParams, ToolsListResult,
};
pub use types::{ClientCapabilities, Info, ServerCapabilities, Tool, ToolsCapability};

/// MCP protocol version spoken by hub and spokes
pub const PROTOCOL_VERSION: &str = "2024-11-05";
