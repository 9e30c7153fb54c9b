//! Fin-Hub - federated financial-analysis mesh over MCP

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use fin_hub::aggregator::{Aggregator, providers::build_providers};
use fin_hub::cli::{Cli, Command, SpokeRole};
use fin_hub::config::Config;
use fin_hub::hub::Hub;
use fin_hub::setup_tracing;
use fin_hub::spoke::{Spoke, market, portfolio, risk};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Command::Hub { port, host } => run_hub(config, port, host).await,
        Command::Spoke { role, port, hub } => run_spoke(config, role, port, hub).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_hub(
    mut config: Config,
    port: Option<u16>,
    host: Option<String>,
) -> fin_hub::Result<()> {
    if let Some(port) = port {
        config.hub.server.port = port;
    }
    if let Some(host) = host {
        config.hub.server.host = host;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.hub.server.host,
        port = config.hub.server.port,
        "Starting hub"
    );
    Hub::new(config).run().await
}

async fn run_spoke(
    mut config: Config,
    role: SpokeRole,
    port: Option<u16>,
    hub: Option<String>,
) -> fin_hub::Result<()> {
    // The role picks the service name unless the config overrides it.
    if config.spoke.name == fin_hub::config::SpokeConfig::default().name {
        config.spoke.name = role.service_name().to_string();
    }
    if let Some(port) = port {
        config.spoke.port = port;
    }
    if let Some(hub) = hub {
        config.spoke.hub_address = hub;
    }

    let spoke = Spoke::new(config.spoke.clone());
    match role {
        SpokeRole::Market => {
            let providers = build_providers(&config.aggregator);
            let aggregator = Arc::new(Aggregator::new(&config.aggregator, providers));
            market::install(&spoke, aggregator);
        }
        SpokeRole::Risk => risk::install(&spoke),
        SpokeRole::Portfolio => portfolio::install(&spoke),
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.spoke.name,
        hub = %config.spoke.hub_address,
        tools = spoke.tools().len(),
        "Starting spoke"
    );
    spoke.run().await
}
