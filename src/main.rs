//! API Gateway - authorizing reverse proxy
//!
//! Verifies bearer tokens against a JWKS, enforces per-route roles and
//! forwards to the configured backend.

use std::process::ExitCode;

use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use api_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    registry::RouteRegistry,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Routes { ref format }) => print_routes(&cli, format),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Print the resolved route table
fn print_routes(cli: &Cli, format: &str) -> ExitCode {
    let registry = match Config::load(cli.config.as_deref())
        .and_then(|config| RouteRegistry::from_services(&config.services))
    {
        Ok(r) => r,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    if format == "json" {
        let rows: Vec<_> = registry
            .routes()
            .map(|r| {
                json!({
                    "service": r.service,
                    "pattern": r.pattern,
                    "target": r.target,
                    "required_roles": r.required_roles,
                })
            })
            .collect();
        match serde_json::to_string_pretty(&rows) {
            Ok(out) => println!("{out}"),
            Err(e) => {
                eprintln!("❌ Failed to serialize to JSON: {e}");
                return ExitCode::FAILURE;
            }
        }
        return ExitCode::SUCCESS;
    }

    if registry.is_empty() {
        println!("No routes configured.");
        return ExitCode::SUCCESS;
    }

    println!("{} route(s), in match order:\n", registry.len());
    for route in registry.routes() {
        let roles = if route.is_public() {
            "public".to_string()
        } else {
            route.required_roles.iter().cloned().collect::<Vec<_>>().join(", ")
        };
        println!("  {:<40} {:<12} {} [{}]", route.pattern, route.service, route.target, roles);
    }
    ExitCode::SUCCESS
}

/// Run the gateway server
async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        services = config.services.len(),
        cache = ?config.cache.backend,
        "Starting API Gateway"
    );

    // Fetches the signing key set; fatal if unreachable
    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
