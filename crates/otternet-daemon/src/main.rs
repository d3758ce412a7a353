//! Otternet Daemon -- headless overlay node for servers and VPS.
//!
//! Usage:
//!
//!   otternet-daemon --wallet <ADDRESS> [OPTIONS]
//!
//! The node joins the overlay through the configured relay and
//! bootstrap peers, serves the files listed in the catalog that belong
//! to the wallet, and runs until interrupted with Ctrl+C.
//!
//! Run with `--help` for the full option list.

use std::sync::Arc;

use otternet_node::coordinator::Coordinator;
use otternet_storage::catalog::JsonCatalog;

mod config;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = match config::CliArgs::parse_from_env() {
        Ok(config::CliCommand::Run(cli)) => cli,
        Ok(config::CliCommand::Help) => {
            config::print_help();
            return;
        }
        Err(e) => {
            eprintln!("{e}");
            eprintln!("use --help for usage information");
            std::process::exit(1);
        }
    };

    let daemon_config = match &cli.config_path {
        Some(path) => match config::DaemonConfig::load(path) {
            Ok(cfg) => cfg.merge_cli(&cli),
            Err(e) => {
                tracing::error!("failed to load config file: {e}");
                std::process::exit(1);
            }
        },
        None => config::DaemonConfig::from_cli(&cli),
    };

    if let Err(e) = run_daemon(daemon_config).await {
        tracing::error!("daemon error: {e}");
        std::process::exit(1);
    }
}

// ---------------------------------------------------------------------------
// Daemon main logic
// ---------------------------------------------------------------------------

async fn run_daemon(cfg: config::DaemonConfig) -> Result<(), String> {
    let wallet = cfg.wallet()?.to_owned();
    let net_config = cfg.network_config()?;
    let catalog_path = cfg.catalog_path();

    tracing::info!(
        data_dir = %cfg.data_dir.display(),
        catalog = %catalog_path.display(),
        listen_count = net_config.listen_addrs.len(),
        relay_count = net_config.relay_nodes.len(),
        bootstrap_count = net_config.bootstrap_nodes.len(),
        server_mode = net_config.dht_server_mode,
        "network config"
    );

    let coordinator = Coordinator::new();
    let handle = coordinator
        .start(
            &wallet,
            net_config,
            &cfg.data_dir,
            Arc::new(JsonCatalog::new(catalog_path)),
        )
        .await
        .map_err(|e| format!("node start failed: {e}"))?;

    let listen = handle
        .listeners()
        .await
        .map_err(|e| format!("failed to read listen addresses: {e}"))?;

    println!();
    println!("============================================================");
    println!("  Otternet Daemon running");
    println!("============================================================");
    println!("  Peer ID:      {}", handle.local_peer_id());
    println!("  Wallet:       {wallet}");
    for addr in &listen {
        println!("  Listening:    {addr}");
    }
    println!("  Data dir:     {}", cfg.data_dir.display());
    println!("============================================================");
    println!("  Press Ctrl+C to stop");
    println!("============================================================");
    println!();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(%e, "failed to listen for Ctrl+C");
    }
    tracing::info!("received Ctrl+C, shutting down...");

    coordinator
        .close()
        .await
        .map_err(|e| format!("shutdown failed: {e}"))?;

    tracing::info!("daemon stopped");
    Ok(())
}
