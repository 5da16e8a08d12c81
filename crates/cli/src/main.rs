// FleetFlow CLI
//
// Design Decision: Use clap derive for ergonomic argument parsing.
// Design Decision: Manifests bundle demo agents with one workflow so a run needs no server.
// Design Decision: Support text/json output formats for scripting.

mod agents;
mod commands;
mod manifest;
mod output;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleetflow_core::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "fleetflow")]
#[command(about = "FleetFlow CLI - Validate and run agent workflow manifests")]
#[command(version)]
pub struct Cli {
    /// Orchestrator config (YAML); defaults plus FLEETFLOW_* variables when omitted
    #[arg(long, short, env = "FLEETFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    pub output: String,

    /// Suppress non-essential output
    #[arg(long, short)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check a manifest without running it
    Validate {
        /// YAML or JSON manifest
        manifest: PathBuf,
    },

    /// Run a manifest's workflow to completion
    Run {
        /// YAML or JSON manifest
        manifest: PathBuf,

        /// Workflow input as a JSON object
        #[arg(long, short, default_value = "{}")]
        input: String,

        /// Max wait time in seconds
        #[arg(long, default_value = "300")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_telemetry(TelemetryConfig::from_env());

    let cli = Cli::parse();
    let output_format = output::OutputFormat::from_str(&cli.output);

    match cli.command {
        Commands::Validate { manifest } => {
            commands::validate::run(&manifest, output_format, cli.quiet)
        }
        Commands::Run {
            manifest,
            input,
            timeout,
        } => {
            commands::run::run(
                &manifest,
                cli.config.as_deref(),
                &input,
                timeout,
                output_format,
                cli.quiet,
            )
            .await
        }
    }
}
