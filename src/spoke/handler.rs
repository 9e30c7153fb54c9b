//! Tool dispatch table
//!
//! Tools are values, not types: a spoke keeps a mapping from qualified name
//! to `(descriptor, handler fn)`, and adding a tool is a registration call.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::schema::validate_arguments;
use crate::context::RequestContext;
use crate::protocol::Tool;
use crate::registry::ToolDescriptor;
use crate::{Error, Result};

/// Boxed handler future
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Handler function: `(arguments, context) -> result`
pub type HandlerFn = Arc<dyn Fn(Value, RequestContext) -> HandlerFuture + Send + Sync>;

/// One registered tool: declared schema plus handler
struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: HandlerFn,
}

/// The spoke's tool table
#[derive(Default)]
pub struct ToolSet {
    tools: DashMap<String, RegisteredTool>,
}

impl ToolSet {
    /// Create an empty tool set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its qualified name
    pub fn register<F, Fut>(&self, descriptor: ToolDescriptor, handler: F)
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let name = descriptor.qualified_name.clone();
        self.tools.insert(
            name,
            RegisteredTool {
                descriptor,
                handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
            },
        );
    }

    /// Declared descriptors, sorted by name
    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<ToolDescriptor> = self
            .tools
            .iter()
            .map(|entry| entry.value().descriptor.clone())
            .collect();
        all.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        all
    }

    /// Descriptors in MCP `tools/list` shape
    #[must_use]
    pub fn as_protocol_tools(&self) -> Vec<Tool> {
        self.descriptors()
            .into_iter()
            .map(|d| Tool {
                name: d.qualified_name,
                description: (!d.description.is_empty()).then_some(d.description),
                input_schema: d.input_schema,
                output_schema: d.output_schema,
            })
            .collect()
    }

    /// Number of registered tools
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch a call: look up the handler, validate arguments against the
    /// declared schema, invoke, and classify handler failures.
    pub async fn call(
        &self,
        qualified_name: &str,
        arguments: Value,
        ctx: RequestContext,
    ) -> Result<Value> {
        let (handler, schema) = {
            let Some(entry) = self.tools.get(qualified_name) else {
                return Err(Error::MethodNotFound(format!(
                    "tool not found: {qualified_name}"
                )));
            };
            (
                Arc::clone(&entry.handler),
                entry.descriptor.input_schema.clone(),
            )
        };

        let validation = validate_arguments(&arguments, &schema);
        if !validation.is_valid() {
            return Err(Error::InvalidParams(validation.format_error()));
        }

        debug!(
            tool = qualified_name,
            correlation = ctx.correlation_id(),
            "Invoking handler"
        );

        match handler(validation.coerced, ctx).await {
            Ok(value) => Ok(value),
            // Structured kinds pass through; anything unclassified surfaces
            // as a handler failure.
            Err(
                e @ (Error::InvalidParams(_)
                | Error::DataNotFound(_)
                | Error::AllProvidersFailed { .. }
                | Error::ProviderRateLimited(_)
                | Error::DeadlineExceeded(_)
                | Error::Cancelled(_)
                | Error::HandlerFailure { .. }),
            ) => Err(e),
            Err(e) => Err(Error::HandlerFailure {
                tool: qualified_name.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
