//! BFD Pipeline - Main entry point

use bfd_common::logging::{init_logging, LogConfig, LogOutput};
use bfd_pipeline::config::AppConfig;
use bfd_pipeline::shutdown::shutdown_signal;
use bfd_pipeline::{build_pipeline, Cli, Commands};
use clap::Parser;
use std::process;
use tracing::{error, info, level_filters::LevelFilter};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::builder()
            .level(LevelFilter::DEBUG)
            .output(LogOutput::Console)
            .build()
    } else {
        LogConfig::from_env().unwrap_or_default()
    };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("Warning: failed to initialise logging: {e}");
    }

    if let Err(e) = execute(cli.command).await {
        error!(error = %format!("{e:#}"), "Pipeline failed");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn execute(command: Commands) -> anyhow::Result<()> {
    let mut config = AppConfig::load()?;

    match command {
        Commands::CheckConfig => {
            println!(
                "Configuration OK (worker slots: {}, CCW: {}, RDA: {})",
                config.manager.worker_slots, config.ccw.enabled, config.rda.enabled
            );
            Ok(())
        },
        Commands::Run { worker_slots } => {
            if let Some(slots) = worker_slots {
                config.manager.worker_slots = slots;
            }
            run(config).await
        },
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    info!("Starting BFD pipeline");

    let manager = build_pipeline(&config).await?;
    manager.start().await?;

    shutdown_signal().await;

    manager.stop(config.manager.shutdown_grace).await;
    info!("BFD pipeline stopped");
    Ok(())
}
