//! Runner - ephemeral challenge instances behind an HTTP API.
//!
//! Usage:
//!   runner serve [--config-dir .]       # Start the runner
//!   runner challenge-id <name>          # Print the id derived from a challenge name

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use runner::backend::portainer::PortainerBackend;
use runner::backend::{Backend, SessionCache};
use runner::balancer::Balancer;
use runner::engine::Engine;
use runner::http_server;
use runner::models::challenge_id_for;
use runner::ports::PortAllocator;
use runner::state::AppState;
use runner::store;
use runner::tasks::TaskQueue;
use runner::workers::{self, ReclaimWorker, RefreshWorker};

/// How long queued backend work may run on after the server stops.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "runner")]
#[command(about = "Ephemeral challenge instances on Portainer")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server and background workers
    Serve {
        /// Directory holding config.json and credentials.json
        #[arg(long, default_value = ".")]
        config_dir: PathBuf,
    },
    /// Print the challenge id derived from a challenge name
    ChallengeId { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Args::parse().command {
        Commands::Serve { config_dir } => serve(config_dir).await,
        Commands::ChallengeId { name } => {
            println!("{}", challenge_id_for(name.trim()));
            Ok(())
        }
    }
}

async fn serve(config_dir: PathBuf) -> anyhow::Result<()> {
    let (config, credentials) = runner::config::load(&config_dir)
        .with_context(|| format!("loading configuration from {}", config_dir.display()))?;
    info!(
        port = config.runner_port,
        endpoints = credentials.portainer_credentials.len(),
        strategy = ?config.balance_strategy,
        "configuration loaded"
    );

    let sessions = Arc::new(SessionCache::new());
    let backend: Arc<dyn Backend> = Arc::new(
        PortainerBackend::new(
            Arc::clone(&sessions),
            config.portainer_environment_id,
            config.portainer_accept_invalid_certs,
        )
        .context("building Portainer client")?,
    );

    let refresher = RefreshWorker::new(
        Arc::clone(&backend),
        Arc::clone(&sessions),
        credentials.portainer_credentials.clone(),
        config.refresh_interval(),
    );
    let logged_in = refresher.refresh_all().await;
    if logged_in == 0 {
        bail!("could not log in to any Portainer endpoint");
    }
    if logged_in < credentials.portainer_credentials.len() {
        warn!(logged_in, "some Portainer endpoints are unreachable");
    }

    let store = store::connect(
        &credentials.database_url,
        config.database_max_retry_attempts,
        config.database_error_wait(),
    )
    .await
    .context("connecting to the database")?;

    let engine = Arc::new(Engine::new(
        config.engine_settings(),
        store,
        backend,
        PortAllocator::new(config.reserved_ports()),
        Balancer::new(config.balance_strategy, credentials.endpoints()),
        TaskQueue::start(config.task_queue_capacity, config.task_workers),
    ));
    let restored = engine
        .resync()
        .await
        .context("restoring state from the database")?;
    info!(restored, "state restored");

    let shutdown = CancellationToken::new();
    let reclaimer = tokio::spawn(
        ReclaimWorker::new(Arc::clone(&engine), config.reclaim_interval()).run(shutdown.clone()),
    );
    let refresh = tokio::spawn(refresher.run(shutdown.clone()));

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "cannot listen for Ctrl-C");
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.runner_port));
    let state = AppState::new(Arc::clone(&engine), &credentials.api_authorization);
    let served = http_server::run_server(addr, state, shutdown.clone()).await;

    shutdown.cancel();
    workers::join_workers(vec![("reclaim", reclaimer), ("session refresh", refresh)]).await;
    if tokio::time::timeout(SHUTDOWN_GRACE, engine.tasks().wait_idle())
        .await
        .is_err()
    {
        warn!(pending = engine.tasks().pending(), "background tasks still running at exit");
    }
    info!("runner stopped");

    served.context("HTTP server failed")
}
