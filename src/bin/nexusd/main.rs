//! `nexusd` — thin process entrypoint (§4.9 ambient addition). `serve` is the
//! default subcommand; `status`/`init-token` are the smallest operable shim
//! around the daemon, not a full job-submission client.

use clap::{Parser, Subcommand};
use nexus::auth::AuthGate;
use nexus::config;
use nexus::gpu::GpuProbe;
use nexus::logs::LogBuffer;
use nexus::notify::Notifier;
use nexus::scheduler::Scheduler;
use nexus::server::{self, ServerState};
use nexus::session::TmuxRunner;
use nexus::store::Store;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "nexusd", author, version, about = "Nexus GPU job scheduler daemon")]
struct Nexusd {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Overrides $NEXUS_HOME / the platform data dir.
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the scheduler and HTTP server (default).
    Serve,
    /// Check whether the configured port answers `/health`.
    Status,
    /// Regenerate the bearer token file.
    InitToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Nexusd::parse();
    let home = match cli.home {
        Some(h) => h,
        None => config::home_dir()?,
    };

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&home).await,
        Commands::Status => status(&home).await,
        Commands::InitToken => init_token(&home),
    }
}

async fn serve(home: &std::path::Path) -> anyhow::Result<()> {
    let log_buffer = LogBuffer::new();
    init_logging(log_buffer.clone());

    let config = config::load_config(home)?;
    let auth_gate = Arc::new(AuthGate::init(home)?);
    let store = Store::open(&config::db_path(home))?;
    let gpu_probe = Arc::new(GpuProbe::new(Duration::from_secs(1))?);
    let runner: Arc<dyn nexus::session::SessionRunner> = Arc::new(TmuxRunner::default());
    let notifier = Arc::new(Notifier::new(&config.notifications));
    let jobs_root = config::jobs_dir(home);
    std::fs::create_dir_all(&jobs_root)?;

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        gpu_probe.clone(),
        runner,
        notifier,
        jobs_root,
        config.daemon.clone(),
    ));
    scheduler.reconcile_orphans()?;
    let scheduler_task = tokio::spawn(scheduler.clone().run());

    let server_state = ServerState {
        store,
        gpu_probe,
        log_buffer,
        config: config.daemon.clone(),
        started_at: std::time::Instant::now(),
    };
    let app = server::router(server_state, auth_gate);
    let listener = server::bind(&config.daemon).await?;
    tracing::info!(addr = %listener.local_addr()?, "nexusd listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    scheduler.stop_handle().store(true, std::sync::atomic::Ordering::SeqCst);
    if let Err(e) = scheduler_task.await {
        tracing::warn!(error = %e, "scheduler task did not shut down cleanly");
    }

    tracing::info!("nexusd shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
    }
}

async fn status(home: &std::path::Path) -> anyhow::Result<()> {
    let config = config::load_config(home)?;
    let url = format!("http://{}:{}/v1/health", config.daemon.host, config.daemon.port);
    match reqwest::get(&url).await {
        Ok(resp) if resp.status().is_success() => {
            println!("nexusd is up ({url})");
            Ok(())
        }
        Ok(resp) => anyhow::bail!("{url} returned {}", resp.status()),
        Err(e) => anyhow::bail!("nexusd is not reachable at {url}: {e}"),
    }
}

fn init_token(home: &std::path::Path) -> anyhow::Result<()> {
    let gate = AuthGate::regenerate(home)?;
    println!("{}", gate.token());
    Ok(())
}

fn init_logging(log_buffer: LogBuffer) {
    use tracing_subscriber::prelude::*;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_ansi(true))
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(log_buffer))
        .init();
}
