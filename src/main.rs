mod collectors;
mod config;
mod http;
mod metrics;
mod poller;
mod profile;
mod ssh_config;
mod state;

use axum::serve;
use clap::Parser;
use collectors::session::SshExecutor;
use collectors::INSPECTION_SCRIPT;
use config::Config;
use metrics::Metrics;
use poller::Poller;
use ssh_config::ResolveContext;
use state::{now_unix, FleetState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetmon")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Print the profiles resolved from an OpenSSH config file as JSON and exit.
    #[arg(long, value_name = "SSH_CONFIG")]
    resolve: Option<String>,
    #[arg(long)]
    interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let ctx = Arc::new(ResolveContext::from_env());
    if let Some(path) = cli.resolve.as_deref() {
        print_resolved(path, &ctx);
        return;
    }

    let mut cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(interval_secs) = cli.interval_secs {
        cfg.interval_secs = interval_secs;
        if let Err(err) = cfg.validate() {
            error!(error = %err, "invalid --interval-secs");
            std::process::exit(1);
        }
    }

    let loaded = match cfg.load_profiles(&ctx) {
        Ok(loaded) => loaded,
        Err(err) => {
            error!(error = %err, "failed to load node profiles");
            std::process::exit(1);
        }
    };
    for diagnostic in &loaded.diagnostics {
        warn!(%diagnostic, "ssh config line skipped");
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        nodes = loaded.profiles.len(),
        "starting fleetmon"
    );

    let shared_state = Arc::new(RwLock::new(FleetState::new(
        now_unix(),
        cfg.interval_secs,
        cfg.history_capacity,
    )));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "failed to initialize metrics");
            std::process::exit(1);
        }
    };

    let executor = Arc::new(SshExecutor::new(cfg.ssh.settings(&ctx)));
    let (mut poller, poller_handle) = Poller::new(
        executor,
        metrics.clone(),
        shared_state.clone(),
        INSPECTION_SCRIPT,
        Duration::from_secs(cfg.interval_secs),
    );
    poller.register(loaded.profiles).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let app = http::build_router(
            metrics.clone(),
            shared_state.clone(),
            poller_handle.clone(),
            ctx.clone(),
        );
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "invalid listen address");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "failed to start HTTP server");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "HTTP server error");
            }
        })
    };

    let poller_task = tokio::spawn(poller.run(shutdown_rx.clone()));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to wait for Ctrl+C");
    }
    info!("Ctrl+C received, shutting down");

    let _ = shutdown_tx.send(true);

    let _ = poller_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_resolved(path: &str, ctx: &ResolveContext) {
    let imported = match profile::import_file(ctx.expand_home(path), ctx) {
        Ok(imported) => imported,
        Err(err) => {
            error!(error = %err, path = %path, "failed to resolve ssh config");
            std::process::exit(1);
        }
    };
    for diagnostic in &imported.diagnostics {
        warn!(%diagnostic, "ssh config line skipped");
    }
    match serde_json::to_string_pretty(&imported.profiles) {
        Ok(json) => println!("{json}"),
        Err(err) => {
            error!(error = %err, "failed to encode profiles");
            std::process::exit(1);
        }
    }
}
