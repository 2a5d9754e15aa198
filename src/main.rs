use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use cks::admin::PoolBootstrapper;
use cks::api::{self, AppState};
use cks::config::Config;
use cks::pool::ClusterPool;
use cks::scenario::ScenarioCatalog;
use cks::session::SessionManager;
use cks::templates::TemplateStore;
use cks::terminal::TerminalMux;
use cks::validation::ValidationEngine;
use cks::vm::{KubeVirtDriver, VmDriver};

#[derive(Parser)]
#[command(name = "cks")]
#[command(about = "Orchestrator for KubeVirt-backed Kubernetes practice environments", long_about = None)]
struct Cli {
    /// Enable verbose debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the listen address from the environment
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    let mut config = Config::from_env();
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    let config = Arc::new(config);

    let templates = Arc::new(
        TemplateStore::load(&config.template_path).context("failed to load manifest templates")?,
    );
    let catalog = Arc::new(
        ScenarioCatalog::load(&config.scenarios_path).context("failed to load scenario catalog")?,
    );

    let driver: Arc<dyn VmDriver> = Arc::new(
        KubeVirtDriver::connect(Arc::clone(&config), templates)
            .await
            .context("failed to build the kube client")?,
    );
    driver
        .verify_available()
        .await
        .context("virtualization platform unreachable")?;

    let pool = ClusterPool::new(Arc::clone(&driver));
    let terminals = TerminalMux::new(&config.ssh_user);
    let engine = ValidationEngine::new(Arc::clone(&driver));
    let sessions = SessionManager::new(
        Arc::clone(&config),
        Arc::clone(&driver),
        pool.clone(),
        Arc::clone(&catalog),
        engine,
        terminals.clone(),
    );
    let bootstrap = PoolBootstrapper::new(pool.clone(), Arc::clone(&driver));

    // background maintenance, all stopped by the same broadcast on shutdown
    let (shutdown_tx, _) = broadcast::channel(1);
    sessions.start_sweeper(shutdown_tx.subscribe());
    pool.start_maintenance(shutdown_tx.subscribe());
    terminals.start_sweeper(shutdown_tx.subscribe());

    let state = AppState {
        sessions,
        terminals,
        pool,
        catalog,
        bootstrap,
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            let _ = shutdown_tx.send(());
        })
        .await?;

    Ok(())
}

fn setup_tracing(verbose: bool) {
    let default = if verbose { "cks=debug" } else { "cks=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter))
        .init();
}
