use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use orcha::{CoreCredentials, Scheduler, Settings, TaskRunner};
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Scheduling and run tracking for Postgres-backed tasks.
#[derive(Parser, Debug)]
#[command(name = "orcha")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check credentials and wait for the database to answer.
    Check,
    /// Check, then create or verify the orcha schemas.
    Init,
    /// Initialise, then run the scheduler and a task runner until Ctrl-C.
    Serve,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = Settings::load()?;

    let loglevel = cli.log_level.clone().unwrap_or_else(|| settings.loglevel.clone());
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(loglevel));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    let creds = CoreCredentials::from_env()?;
    info!(
        credentials = %creds.redacted(),
        application_name = %settings.application_name,
        loglevel = %settings.loglevel
    );

    orcha::db::wait_for_database(&creds, settings.readiness_timeout()).await?;
    if matches!(cli.command, Command::Check) {
        let pool = orcha::db::connect(&creds, &settings.application_name)?;
        orcha::db::ping(&pool).await?;
        info!("database check passed");
        return Ok(());
    }

    let log = orcha::initialise(&creds, &settings.application_name).await?;
    if matches!(cli.command, Command::Init) {
        return Ok(());
    }

    let runner = TaskRunner::new(settings.runner.clone(), true)?;
    let scheduler = Scheduler::new(settings.scheduler.clone());
    scheduler.start().await?;
    log.add_entry("orcha", "info", "Scheduler started", serde_json::json!({}))
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    scheduler.stop().await;
    runner.stop_all(true).await;
    log.add_entry("orcha", "info", "Scheduler stopped", serde_json::json!({}))
        .await?;
    Ok(())
}
