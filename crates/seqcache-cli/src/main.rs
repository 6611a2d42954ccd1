//! seqcache command-line interface.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

mod commands;

/// Drive and inspect sequence caches without a model.
#[derive(Debug, Parser)]
#[command(name = "seqcache")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log level
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or text)
    #[arg(long, default_value = "text", global = true)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum KindArg {
    Unified,
    Recurrent,
    Iswa,
    Hybrid,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Decode mock sequences through a cache and report occupancy
    Simulate {
        /// Configuration file (JSON); defaults are used when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the cache kind (the model is adjusted to match)
        #[arg(short, long)]
        kind: Option<KindArg>,

        /// Parallel sequences
        #[arg(short = 'n', long, default_value = "2")]
        seqs: u32,

        /// Prompt tokens per sequence
        #[arg(short, long, default_value = "64")]
        prompt: u32,

        /// Single-token steps per sequence after the prompt
        #[arg(short, long, default_value = "32")]
        steps: u32,

        /// Save the final session to this file
        #[arg(long)]
        save: Option<PathBuf>,

        /// Resume from a saved session before decoding
        #[arg(long)]
        resume: Option<PathBuf>,

        /// Serve Prometheus metrics on this port while running
        #[arg(long)]
        metrics_port: Option<u16>,
    },

    /// Describe a saved session file
    Inspect {
        /// Session file
        session: PathBuf,

        /// Configuration used to write the session; enables per-sequence details
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print or check a configuration file
    Config {
        /// Configuration to validate; prints a default configuration when omitted
        path: Option<PathBuf>,

        /// Cache kind of the printed default configuration
        #[arg(short, long)]
        kind: Option<KindArg>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let format = match cli.log_format {
        LogFormatArg::Json => runtime::LogFormat::Json,
        LogFormatArg::Text => runtime::LogFormat::Text,
    };
    runtime::init_logging(&cli.log_level, format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting seqcache CLI");

    match cli.command {
        Commands::Simulate {
            config,
            kind,
            seqs,
            prompt,
            steps,
            save,
            resume,
            metrics_port,
        } => {
            let options = commands::simulate::SimulateOptions {
                config,
                kind,
                seqs,
                prompt,
                steps,
                save,
                resume,
                metrics_port,
            };
            commands::simulate::run(options).context("simulation failed")?;
        }
        Commands::Inspect { session, config } => {
            commands::inspect::run(&session, config.as_deref()).context("inspect failed")?;
        }
        Commands::Config { path, kind } => {
            commands::config::run(path.as_deref(), kind).context("config command failed")?;
        }
    }

    Ok(())
}
