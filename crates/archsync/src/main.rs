//! Archsync - Main entry point

use archsync::commands::run::RunArgs;
use archsync::shutdown::ShutdownController;
use archsync::{Cli, Commands, PipelineConfig, PipelineError};
use archsync_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use clap::Parser;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    // .env is optional
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let code = run_cli(cli).await;

    // Exit without waiting on blocking work a forced stop left behind
    process::exit(code);
}

async fn run_cli(cli: Cli) -> i32 {
    let base = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("archsync")
        .filter_directives("aws_config=warn,aws_smithy_runtime=warn,aws_sdk_s3=warn")
        .build();

    // Environment variables take precedence
    let log_config = match base.clone().merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: ignoring invalid logging environment: {e:#}");
            base
        }
    };

    let _guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    let config = match PipelineConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            eprintln!("Error: {}", e.summary());
            return 1;
        }
    };

    match execute_command(&cli, &config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, kind = e.kind(), "Command failed");
            eprintln!("Error: {}", e.summary());
            1
        }
    }
}

/// Execute the CLI command, returning the process exit code
async fn execute_command(cli: &Cli, config: &PipelineConfig) -> Result<i32, PipelineError> {
    match &cli.command {
        Commands::Run {
            archive,
            dates,
            dry_run,
            validate,
            force,
            no_cleanup,
        } => {
            let args = RunArgs {
                archive: archive.clone(),
                dates: dates.clone().map(|d| d.0),
                dry_run: *dry_run,
                validate: *validate,
                force: *force,
                no_cleanup: *no_cleanup,
            };

            let shutdown = ShutdownController::new();
            let listener = shutdown.install();
            let outcome = archsync::commands::run::run(config, &args, shutdown).await;
            listener.abort();

            Ok(outcome?.exit_code())
        }

        Commands::Status { archive } => {
            archsync::commands::status::run(config, archive).await?;
            Ok(0)
        }

        Commands::Reset { archive, yes } => {
            archsync::commands::reset::run(config, archive, *yes).await?;
            Ok(0)
        }
    }
}
