//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Fin-Hub - federated financial-analysis mesh over MCP
#[derive(Parser, Debug)]
#[command(name = "fin-hub")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "FIN_HUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "FIN_HUB_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "FIN_HUB_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Which process role to run
    #[command(subcommand)]
    pub command: Command,
}

/// Process role
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the hub: RPC frontend, registry, and router
    Hub {
        /// Port to listen on
        #[arg(short, long, env = "FIN_HUB_PORT")]
        port: Option<u16>,

        /// Host to bind to
        #[arg(long, env = "FIN_HUB_HOST")]
        host: Option<String>,
    },
    /// Run a spoke hosting one tool set
    Spoke {
        /// Tool set hosted by this spoke
        #[arg(long, value_enum)]
        role: SpokeRole,

        /// Port to listen on (0 = ephemeral)
        #[arg(short, long, env = "FIN_HUB_SPOKE_PORT")]
        port: Option<u16>,

        /// Hub base URL
        #[arg(long, env = "FIN_HUB_HUB_ADDRESS")]
        hub: Option<String>,
    },
}

/// Tool set a spoke can host
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpokeRole {
    /// Market data tools backed by the aggregator
    Market,
    /// Risk analysis tools
    Risk,
    /// Portfolio construction tools
    Portfolio,
}

impl SpokeRole {
    /// Default logical service name for this role
    #[must_use]
    pub fn service_name(self) -> &'static str {
        match self {
            Self::Market => "market-spoke",
            Self::Risk => "risk-spoke",
            Self::Portfolio => "portfolio-spoke",
        }
    }
}
