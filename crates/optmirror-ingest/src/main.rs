//! optmirror - main entry point

use clap::Parser;
use optmirror_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use optmirror_ingest::{commands, Cli, Commands, IngestConfig, JobStatus};
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("optmirror")
        .build();
    let log_config = log_config.clone().with_env_overrides().unwrap_or(log_config);
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: failed to initialise logging: {e:#}");
    }

    let status = match execute_command(&cli).await {
        Ok(status) => status,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            JobStatus::Fatal
        },
    };

    process::exit(status.exit_code());
}

async fn execute_command(cli: &Cli) -> anyhow::Result<JobStatus> {
    let mut config = IngestConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);

    match &cli.command {
        Commands::Fetch {
            concurrency,
            no_shuffle,
            ..
        } => {
            if let Some(n) = concurrency {
                config.fetch_concurrency = *n;
            }
            if *no_shuffle {
                config.shuffle = false;
            }
        },
        Commands::Query { .. } => config.progress = false,
        _ => {},
    }
    config.validate()?;

    match &cli.command {
        Commands::Index { out, prefix } => {
            commands::index::run(&config, out.as_deref(), prefix.as_deref()).await
        },
        Commands::Fetch { catalog, prefix, .. } => {
            commands::fetch::run(&config, catalog.as_deref(), prefix.as_deref()).await
        },
        Commands::Convert { args } => commands::convert::run(&config, args).await,
        Commands::Run { prefix, args } => commands::run::run(&config, prefix.as_deref(), args).await,
        Commands::Query {
            value,
            predicates,
            dir,
            count,
        } => commands::query::run(&config, value, predicates, dir.clone(), *count).await,
    }
}
