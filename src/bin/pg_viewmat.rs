//! `pg_viewmat` — keep materialized copies of PostgreSQL views up to date.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pg_viewmat::config::LogFormat;
use pg_viewmat::pg::{self, PgCatalog, PgGate};
use pg_viewmat::policy::SystemClock;
use pg_viewmat::{Scheduler, SchedulerConfig, ViewMatError};

#[derive(Parser, Debug)]
#[command(name = "pg_viewmat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long = "config", value_name = "FILE", env = "PG_VIEWMAT_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL connection string (overrides the configuration)
    #[arg(long = "database-url", value_name = "URL")]
    database_url: Option<String>,

    /// Print the ranked schedule as JSON and exit without changing the database
    #[arg(long = "print-schedule")]
    print_schedule: bool,
}

fn init_logging(config: &SchedulerConfig) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter));

    match config.log.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

/// Cancel `token` on Ctrl-C or SIGTERM.
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, "pg_viewmat: cannot listen for SIGTERM");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("pg_viewmat: shutdown requested, finishing the current refresh");
        token.cancel();
    });
}

async fn run(cli: &Cli, config: SchedulerConfig) -> Result<(), ViewMatError> {
    let url = config
        .database_url
        .clone()
        .ok_or_else(|| ViewMatError::InvalidConfig("no database_url configured".to_string()))?;

    let catalog = PgCatalog::new(pg::connect(&url).await?);
    let schedule = Scheduler::plan(&catalog, &config).await?;

    if cli.print_schedule {
        let json = serde_json::to_string_pretty(&schedule)
            .map_err(|e| ViewMatError::Internal(format!("serializing schedule: {e}")))?;
        println!("{json}");
        return Ok(());
    }

    let policy = config.schedule_policy()?;
    let mut trigger = policy.clone().into_trigger(Arc::new(SystemClock))?;

    let gate = Arc::new(PgGate::new(pg::connect(&url).await?));
    let mut scheduler = Scheduler::start(schedule, gate, config).await?;

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    info!(schedule = %policy, views = scheduler.schedule().len(), "pg_viewmat: refresh loop started");
    scheduler.run(trigger.as_mut(), &cancel).await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match SchedulerConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pg_viewmat: {e}");
            return ExitCode::from(2);
        }
    };
    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }

    init_logging(&config);

    match run(&cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "pg_viewmat: startup failed");
            ExitCode::FAILURE
        }
    }
}
