//! mockd - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use mockd::server::{router, shutdown_signal, AppState};
use mockd::MockServerConfig;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mockd",
    about = "Mock API server - sandboxed data templates and upstream proxying",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "mockd.yaml")]
    config: PathBuf,

    /// Listen address, overriding server.listen
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let builder = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false);
    if args.log_json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }

    if args.print_config {
        let default_config = include_str!("../config/default-config.yaml");
        println!("{}", default_config);
        return Ok(());
    }

    let config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        MockServerConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no projects)");
        MockServerConfig::default()
    };

    if args.validate {
        config.validate()?;
        println!(
            "Configuration is valid ({} projects, {} mocks defined)",
            config.projects.len(),
            config.mock_count()
        );
        return Ok(());
    }

    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());
    let state = AppState::from_config(&config)
        .await
        .context("Failed to seed mock definitions")?;
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind to {listen}"))?;
    info!(listen = %listen, "Starting mock server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}
