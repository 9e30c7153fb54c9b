//! Fin-Hub Library
//!
//! Hub-and-spoke service mesh exposing federated financial-analysis tools
//! (market data, risk, portfolio) behind a single MCP (JSON-RPC 2.0)
//! endpoint.
//!
//! # Components
//!
//! - **Hub**: RPC frontend, service registry with health monitoring, and a
//!   tool execution router with circuit breaking, retry, and per-instance
//!   concurrency bounds.
//! - **Spokes**: satellite processes hosting schema-described tool handlers,
//!   registered with the hub and kept visible by heartbeats.
//! - **Aggregator**: the market spoke's multi-source data layer — an ordered
//!   provider fallback chain with token-bucket rate limits and a coalescing
//!   TTL cache.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod aggregator;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod failsafe;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod secrets;
pub mod spoke;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
