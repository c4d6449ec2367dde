use clap::Parser;
use taskproc_core::config::TaskprocConfig;
use tracing::{info, warn};

mod app;
mod jobs;

/// Cron job scheduler with live schedule reconciliation.
#[derive(Debug, Parser)]
#[command(name = "taskproc", version)]
struct Cli {
    /// Config file path (default: $TASKPROC_CONFIG, then ~/.taskproc/taskproc.toml).
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskproc=info,taskproc_scheduler=info,taskproc_hooks=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > TASKPROC_CONFIG env > ~/.taskproc/taskproc.toml
    let config_path = cli.config.or_else(|| std::env::var("TASKPROC_CONFIG").ok());
    let config = TaskprocConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TaskprocConfig::default()
    });

    let app = app::App::build(&config).await?;
    info!(
        jobs = app.registry.ids().len(),
        listeners = app.listeners.len(),
        reconciler = app.reconciler.is_some(),
        "scheduler configured"
    );

    app.scheduler.start().await?;
    info!(workers = config.scheduler.worker_count, "taskproc running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    let wait = config.scheduler.wait_for_jobs_on_shutdown;
    info!(wait_for_running_jobs = wait, "shutting down");
    app.scheduler.shutdown(wait).await?;
    info!("taskproc stopped");
    Ok(())
}
