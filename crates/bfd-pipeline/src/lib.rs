//! BFD Pipeline Library
//!
//! Ingests CCW RIF extracts and the claims-change stream.
//!
//! # Overview
//!
//! - **Jobs**: [`jobs::PipelineManager`] runs job records on a fixed number of
//!   worker slots, fed by the volunteer and scheduler loops
//! - **CCW**: [`ccw::CcwRifLoadJob`] loads data sets from the bucket in
//!   foreign-key-safe order
//! - **RDA**: [`rda::RdaLoadJob`] streams claim changes into a
//!   [`sink::BatchSink`], resuming from the last committed sequence
//! - **Storage**: [`storage::ObjectStore`] with checksum-verified downloads
//!
//! Configuration comes from the environment, see [`config::AppConfig`].

#![deny(clippy::unwrap_used, clippy::expect_used)]

use clap::{Parser, Subcommand};

pub mod app;
pub mod ccw;
pub mod config;
pub mod db;
pub mod error;
pub mod jobs;
pub mod rda;
pub mod shutdown;
pub mod sink;
pub mod storage;

pub use app::build_pipeline;
pub use error::JobError;

/// BFD ingestion pipeline
#[derive(Parser, Debug)]
#[command(name = "bfd-pipeline")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Debug-level console logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pipeline until SIGINT/SIGTERM
    Run {
        /// Override BFD_WORKER_SLOTS
        #[arg(long)]
        worker_slots: Option<usize>,
    },

    /// Load and validate configuration, then exit
    CheckConfig,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_override() {
        let cli = Cli::try_parse_from(["bfd-pipeline", "-v", "run", "--worker-slots", "6"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Run { worker_slots: Some(6) }));
    }
}
